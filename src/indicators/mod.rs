// Market indicators used by the TPSL loop
pub mod volatility;

pub use volatility::{VolBucket, VolatilityEstimator};
