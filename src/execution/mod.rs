// TPSL execution: price intake, position state, exit decisions
pub mod autoloop;
pub mod executor;
pub mod position_manager;
pub mod price_cache;
pub mod price_feed;

pub use autoloop::{
    AlwaysEnabled, AutoLoop, Command, LoopHandle, LoopStatus, PauseCause, PermissionGate, TpslCore,
};
pub use executor::{ChannelExecutor, DryRunExecutor, ExecutionSink, Intent};
pub use position_manager::PositionManager;
pub use price_cache::PriceCache;
pub use price_feed::{fetch_price, ManualPriceSource, PriceSource};
