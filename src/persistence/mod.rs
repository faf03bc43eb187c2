// Durable state and observability log
pub mod event_log;
pub mod state_manager;

pub use event_log::{EventLog, EventRecord, TpslEvent};
pub use state_manager::{LoadOutcome, PersistedState, StateManager, CURRENT_SCHEMA_VERSION};
