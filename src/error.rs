use thiserror::Error;

/// Everything the TPSL subsystem can fail with.
///
/// `DataUnavailable` and `Persistence` are operational and recoverable:
/// the loop keeps running. `InvalidLevel`, `AlreadyOpen`, `NotClosing`,
/// `NotOpen` and `UnknownPosition` are rejected calls that leave state
/// untouched.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TpslError {
    #[error("price unavailable for {symbol}: {reason}")]
    DataUnavailable { symbol: String, reason: String },

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("invalid level: {0}")]
    InvalidLevel(String),

    #[error("position already open for {0}")]
    AlreadyOpen(String),

    #[error("position {0} is not closing")]
    NotClosing(String),

    #[error("position {0} is not open")]
    NotOpen(String),

    #[error("no position for {0}")]
    UnknownPosition(String),

    #[error("execution rejected: {0}")]
    ExecutionRejected(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl TpslError {
    pub fn data_unavailable(symbol: &str, reason: impl Into<String>) -> Self {
        TpslError::DataUnavailable {
            symbol: symbol.to_string(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable code used in `error_halt` events.
    pub fn code(&self) -> &'static str {
        match self {
            TpslError::DataUnavailable { .. } => "DATA_UNAVAILABLE",
            TpslError::Persistence(_) => "PERSISTENCE",
            TpslError::InvalidLevel(_) => "INVALID_LEVEL",
            TpslError::AlreadyOpen(_) => "ALREADY_OPEN",
            TpslError::NotClosing(_) => "NOT_CLOSING",
            TpslError::NotOpen(_) => "NOT_OPEN",
            TpslError::UnknownPosition(_) => "UNKNOWN_POSITION",
            TpslError::ExecutionRejected(_) => "EXECUTION_REJECTED",
            TpslError::Config(_) => "CONFIG",
        }
    }
}

impl From<std::io::Error> for TpslError {
    fn from(e: std::io::Error) -> Self {
        TpslError::Persistence(e.to_string())
    }
}
