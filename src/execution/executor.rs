use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::ExitReason;
use crate::TpslError;

/// Request handed to the execution collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum Intent {
    StartExit {
        symbol: String,
        reason: ExitReason,
    },
    /// Hard stop hit before trailing armed
    EmergencyExit {
        symbol: String,
        reason: ExitReason,
    },
    StaleData {
        symbol: String,
        consecutive_misses: u32,
    },
}

impl Intent {
    pub fn symbol(&self) -> &str {
        match self {
            Intent::StartExit { symbol, .. }
            | Intent::EmergencyExit { symbol, .. }
            | Intent::StaleData { symbol, .. } => symbol,
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, Intent::StartExit { .. } | Intent::EmergencyExit { .. })
    }
}

/// Fire-and-forget destination for intents
///
/// Order placement, retries and fills belong to the implementor. Fills come
/// back to the loop as `Command::PositionClosed`.
pub trait ExecutionSink {
    fn submit(&self, intent: Intent) -> Result<(), TpslError>;
}

/// Forwards intents over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelExecutor {
    tx: mpsc::UnboundedSender<Intent>,
}

impl ChannelExecutor {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Intent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ExecutionSink for ChannelExecutor {
    fn submit(&self, intent: Intent) -> Result<(), TpslError> {
        self.tx
            .send(intent)
            .map_err(|e| TpslError::ExecutionRejected(format!("receiver dropped: {:?}", e.0)))
    }
}

/// Logs intents and does nothing else
#[derive(Debug, Clone, Default)]
pub struct DryRunExecutor;

impl ExecutionSink for DryRunExecutor {
    fn submit(&self, intent: Intent) -> Result<(), TpslError> {
        tracing::info!(symbol = %intent.symbol(), ?intent, "[DRY RUN] Intent not executed");
        Ok(())
    }
}

impl<T: ExecutionSink + ?Sized> ExecutionSink for std::sync::Arc<T> {
    fn submit(&self, intent: Intent) -> Result<(), TpslError> {
        (**self).submit(intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_executor_forwards() {
        let (executor, mut rx) = ChannelExecutor::new();
        executor
            .submit(Intent::StartExit {
                symbol: "BTCUSDT".to_string(),
                reason: ExitReason::TakeProfit,
            })
            .unwrap();

        let intent = rx.try_recv().unwrap();
        assert_eq!(intent.symbol(), "BTCUSDT");
        assert!(intent.is_exit());
    }

    #[test]
    fn test_channel_executor_rejects_after_drop() {
        let (executor, rx) = ChannelExecutor::new();
        drop(rx);

        let result = executor.submit(Intent::StaleData {
            symbol: "ETHUSDT".to_string(),
            consecutive_misses: 3,
        });
        assert!(matches!(result, Err(TpslError::ExecutionRejected(_))));
    }

    #[test]
    fn test_dry_run_accepts_everything() {
        let executor = DryRunExecutor;
        assert!(executor
            .submit(Intent::EmergencyExit {
                symbol: "SOLUSDT".to_string(),
                reason: ExitReason::StopLoss,
            })
            .is_ok());
    }

    #[test]
    fn test_intent_wire_format() {
        let json = serde_json::to_value(Intent::StaleData {
            symbol: "BTCUSDT".to_string(),
            consecutive_misses: 3,
        })
        .unwrap();
        assert_eq!(json["intent"], "stale_data");
        assert_eq!(json["consecutive_misses"], 3);
    }
}
