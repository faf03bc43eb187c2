use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{Result, TpslError};

/// Latest price for a symbol
///
/// Implementations report any failure as `DataUnavailable`; the loop treats
/// that as a missed tick for the symbol.
pub trait PriceSource: Send + Sync {
    fn get_price(&self, symbol: &str) -> impl Future<Output = Result<f64>> + Send;
}

impl<T: PriceSource> PriceSource for Arc<T> {
    fn get_price(&self, symbol: &str) -> impl Future<Output = Result<f64>> + Send {
        (**self).get_price(symbol)
    }
}

/// Fetch one price, bounded by `timeout`
///
/// Timeouts and non-positive prices become `DataUnavailable`.
pub async fn fetch_price<P: PriceSource>(
    source: &P,
    symbol: &str,
    timeout: Duration,
) -> Result<f64> {
    let price = match tokio::time::timeout(timeout, source.get_price(symbol)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(TpslError::data_unavailable(
                symbol,
                format!("timed out after {}ms", timeout.as_millis()),
            ))
        }
    };

    if !(price.is_finite() && price > 0.0) {
        return Err(TpslError::data_unavailable(
            symbol,
            format!("invalid price {}", price),
        ));
    }

    Ok(price)
}

/// In-memory price board, set by hand
///
/// Used for replays and tests; a symbol without a price is unavailable.
#[derive(Debug, Clone, Default)]
pub struct ManualPriceSource {
    prices: Arc<Mutex<HashMap<String, f64>>>,
}

impl ManualPriceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, symbol: &str, price: f64) {
        if let Ok(mut prices) = self.prices.lock() {
            prices.insert(symbol.to_uppercase(), price);
        }
    }

    /// Make the symbol unavailable
    pub fn remove(&self, symbol: &str) {
        if let Ok(mut prices) = self.prices.lock() {
            prices.remove(&symbol.to_uppercase());
        }
    }
}

impl PriceSource for ManualPriceSource {
    fn get_price(&self, symbol: &str) -> impl Future<Output = Result<f64>> + Send {
        let symbol = symbol.to_uppercase();
        let price = self
            .prices
            .lock()
            .ok()
            .and_then(|prices| prices.get(&symbol).copied());

        async move { price.ok_or_else(|| TpslError::data_unavailable(&symbol, "no price set")) }
    }
}
