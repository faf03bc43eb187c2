//! Window volatility bucket for dynamic trailing
//!
//! Relative range over the window: (max - min) / mid, with mid = (max + min) / 2.
//! A range at or above the configured threshold is HIGH, anything else LOW.
//! Two buckets only; the trailing distance for each bucket comes from settings.

use crate::execution::PriceCache;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VolBucket {
    Low,
    High,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolatilityEstimator {
    window_sec: u64,
    high_threshold_pct: f64,
}

impl VolatilityEstimator {
    pub fn new(window_sec: u64, high_threshold_pct: f64) -> Self {
        Self {
            window_sec,
            high_threshold_pct,
        }
    }

    pub fn window_sec(&self) -> u64 {
        self.window_sec
    }

    /// Relative range over the window, or None with fewer than 2 samples
    pub fn relative_range(&self, cache: &PriceCache, symbol: &str) -> Option<f64> {
        let samples = cache.window(symbol, self.window_sec);
        if samples.len() < 2 {
            return None;
        }

        let (min, max) = match cache.get_window_extrema(symbol, self.window_sec) {
            (Some(min), Some(max)) => (min, max),
            _ => return None,
        };

        let mid = (max + min) / 2.0;
        if mid <= 0.0 {
            return None;
        }

        Some((max - min) / mid)
    }

    /// Bucket for the current window, None when data is insufficient
    pub fn assess(&self, cache: &PriceCache, symbol: &str) -> Option<VolBucket> {
        self.relative_range(cache, symbol).map(|range| {
            if range >= self.high_threshold_pct {
                VolBucket::High
            } else {
                VolBucket::Low
            }
        })
    }

    /// Bucket for the current window; insufficient data counts as LOW
    pub fn classify(&self, cache: &PriceCache, symbol: &str) -> VolBucket {
        match self.assess(cache, symbol) {
            Some(bucket) => bucket,
            None => {
                tracing::debug!(
                    symbol = %symbol,
                    samples = cache.len(symbol),
                    window_sec = self.window_sec,
                    "Insufficient price data for volatility, assuming LOW"
                );
                VolBucket::Low
            }
        }
    }
}
