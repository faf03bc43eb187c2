// Core modules
pub mod api;
pub mod config;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod persistence;
pub mod risk;

// Re-export commonly used types
pub use config::{Settings, SettingsSource};
pub use error::TpslError;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, TpslError>;
