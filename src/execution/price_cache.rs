use crate::models::PriceSample;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

/// Bounded ring of recent price samples per symbol
///
/// Owned by the loop task; feeds volatility and extrema queries.
/// Never persisted.
#[derive(Debug, Clone)]
pub struct PriceCache {
    data: HashMap<String, VecDeque<PriceSample>>,
    capacity: usize,
}

impl PriceCache {
    /// Create a new price cache
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of samples to keep per symbol
    pub fn new(capacity: usize) -> Self {
        Self {
            data: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a sample, evicting the oldest once the ring is full
    pub fn record(&mut self, symbol: &str, price: f64, timestamp: DateTime<Utc>) {
        let samples = self
            .data
            .entry(symbol.to_uppercase())
            .or_insert_with(VecDeque::new);

        samples.push_back(PriceSample { timestamp, price });

        while samples.len() > self.capacity {
            samples.pop_front();
        }
    }

    /// Min/max price among samples within `window_sec` of the latest sample
    ///
    /// Returns `(None, None)` when the symbol has no samples.
    pub fn get_window_extrema(&self, symbol: &str, window_sec: u64) -> (Option<f64>, Option<f64>) {
        let window = self.window(symbol, window_sec);
        if window.is_empty() {
            return (None, None);
        }

        let min = window.iter().map(|s| s.price).fold(f64::INFINITY, f64::min);
        let max = window
            .iter()
            .map(|s| s.price)
            .fold(f64::NEG_INFINITY, f64::max);

        (Some(min), Some(max))
    }

    /// Samples within `window_sec` of the latest one, oldest first
    pub fn window(&self, symbol: &str, window_sec: u64) -> Vec<PriceSample> {
        let Some(samples) = self.data.get(&symbol.to_uppercase()) else {
            return Vec::new();
        };
        let Some(latest) = samples.back() else {
            return Vec::new();
        };

        // A window reaching past the representable range covers the whole ring
        let cutoff = i64::try_from(window_sec)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|span| latest.timestamp.checked_sub_signed(span));
        samples
            .iter()
            .filter(|s| cutoff.map_or(true, |cutoff| s.timestamp >= cutoff))
            .copied()
            .collect()
    }

    pub fn latest(&self, symbol: &str) -> Option<PriceSample> {
        self.data
            .get(&symbol.to_uppercase())
            .and_then(|s| s.back().copied())
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.data
            .get(&symbol.to_uppercase())
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, symbol: &str) -> bool {
        self.len(symbol) == 0
    }

    /// Drop samples for a symbol (e.g. after its position closed)
    pub fn clear(&mut self, symbol: &str) {
        self.data.remove(&symbol.to_uppercase());
    }
}
