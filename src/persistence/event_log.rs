use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::models::{ExitReason, LoopState};

/// Observable TPSL events, one JSON object per line
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TpslEvent {
    StateTransition {
        from: LoopState,
        to: LoopState,
        reason: String,
    },
    TrailingUpdated {
        symbol: String,
        peak_price: f64,
        stop_price: f64,
    },
    BreakEven {
        symbol: String,
        stop_price: f64,
    },
    ExitStarted {
        symbol: String,
        reason: ExitReason,
    },
    PositionOpened {
        symbol: String,
        entry_price: f64,
        quantity: f64,
    },
    PositionClosed {
        symbol: String,
        pnl: f64,
        /// Seconds held
        duration: i64,
    },
    ErrorHalt {
        error_code: String,
        context: String,
    },
    RecoveryWarning {
        reason: String,
    },
}

impl TpslEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TpslEvent::StateTransition { .. } => "state_transition",
            TpslEvent::TrailingUpdated { .. } => "trailing_updated",
            TpslEvent::BreakEven { .. } => "break_even",
            TpslEvent::ExitStarted { .. } => "exit_started",
            TpslEvent::PositionOpened { .. } => "position_opened",
            TpslEvent::PositionClosed { .. } => "position_closed",
            TpslEvent::ErrorHalt { .. } => "error_halt",
            TpslEvent::RecoveryWarning { .. } => "recovery_warning",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: TpslEvent,
}

/// Append-only JSONL event sink, mirrored to tracing
///
/// Without a path, events only go to tracing. Write failures are logged and
/// swallowed: observability never stops the loop.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    path: Option<PathBuf>,
}

impl EventLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Tracing only
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn emit(&self, event: TpslEvent) {
        self.emit_at(event, Utc::now());
    }

    pub fn emit_at(&self, event: TpslEvent, ts: DateTime<Utc>) {
        trace_event(&event);

        let Some(path) = &self.path else {
            return;
        };

        let record = EventRecord { ts, event };
        if let Err(e) = append_line(path, &record) {
            tracing::warn!(
                path = %path.display(),
                event = record.event.name(),
                error = %e,
                "Failed to append event"
            );
        }
    }

    /// Read every parsable record from a JSONL file; bad lines are skipped
    pub fn read(path: &Path) -> crate::Result<Vec<EventRecord>> {
        let file = std::fs::File::open(path)?;
        let mut records = Vec::new();

        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EventRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::debug!(error = %e, "Skipping unparsable event line"),
            }
        }

        Ok(records)
    }
}

fn append_line(path: &Path, record: &EventRecord) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)
}

fn trace_event(event: &TpslEvent) {
    match event {
        TpslEvent::StateTransition { from, to, reason } => {
            tracing::info!(%from, %to, reason = %reason, "TPSL state transition");
        }
        TpslEvent::TrailingUpdated {
            symbol,
            peak_price,
            stop_price,
        } => {
            tracing::info!(symbol = %symbol, peak = peak_price, stop = stop_price, "Trailing stop raised");
        }
        TpslEvent::BreakEven { symbol, stop_price } => {
            tracing::info!(symbol = %symbol, stop = stop_price, "Stop moved to break-even");
        }
        TpslEvent::ExitStarted { symbol, reason } => {
            tracing::warn!(symbol = %symbol, reason = %reason, "Exit started");
        }
        TpslEvent::PositionOpened {
            symbol,
            entry_price,
            quantity,
        } => {
            tracing::info!(symbol = %symbol, entry = entry_price, qty = quantity, "Position registered");
        }
        TpslEvent::PositionClosed {
            symbol,
            pnl,
            duration,
        } => {
            tracing::info!(symbol = %symbol, pnl = pnl, duration_secs = duration, "Position exit confirmed");
        }
        TpslEvent::ErrorHalt {
            error_code,
            context,
        } => {
            tracing::error!(error_code = %error_code, context = %context, "TPSL halt");
        }
        TpslEvent::RecoveryWarning { reason } => {
            tracing::warn!(reason = %reason, "Recovery warning");
        }
    }
}
