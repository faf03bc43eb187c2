use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Stale price breaker: trips a symbol after too many missed ticks in a row
#[derive(Debug, Clone)]
pub struct StaleDataBreaker {
    pub max_consecutive_misses: u32,
    misses: HashMap<String, u32>,
    halted: BTreeSet<String>,
}

/// Result of recording a missed price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissOutcome {
    /// Below threshold
    Counted(u32),
    /// Threshold reached on this miss; escalate once
    Tripped(u32),
    /// Already tripped earlier, no new escalation
    StillHalted(u32),
}

impl Default for StaleDataBreaker {
    fn default() -> Self {
        Self::new(3)
    }
}

impl StaleDataBreaker {
    pub fn new(max_consecutive_misses: u32) -> Self {
        Self {
            max_consecutive_misses: max_consecutive_misses.max(1),
            misses: HashMap::new(),
            halted: BTreeSet::new(),
        }
    }

    /// Threshold follows settings reloads; an already tripped symbol stays tripped
    pub fn set_threshold(&mut self, max_consecutive_misses: u32) {
        self.max_consecutive_misses = max_consecutive_misses.max(1);
    }

    pub fn record_miss(&mut self, symbol: &str) -> MissOutcome {
        let symbol = symbol.to_uppercase();
        let count = self.misses.entry(symbol.clone()).or_insert(0);
        *count += 1;
        let count = *count;

        if self.halted.contains(&symbol) {
            return MissOutcome::StillHalted(count);
        }
        if count >= self.max_consecutive_misses {
            self.halted.insert(symbol);
            return MissOutcome::Tripped(count);
        }
        MissOutcome::Counted(count)
    }

    /// Fresh price: reset the counter; true if the symbol was halted
    pub fn record_hit(&mut self, symbol: &str) -> bool {
        let symbol = symbol.to_uppercase();
        self.misses.remove(&symbol);
        self.halted.remove(&symbol)
    }

    pub fn is_halted(&self, symbol: &str) -> bool {
        self.halted.contains(&symbol.to_uppercase())
    }

    pub fn misses(&self, symbol: &str) -> u32 {
        self.misses
            .get(&symbol.to_uppercase())
            .copied()
            .unwrap_or(0)
    }

    pub fn halted_symbols(&self) -> Vec<String> {
        self.halted.iter().cloned().collect()
    }

    /// Drop tracking for a symbol that is no longer managed
    pub fn forget(&mut self, symbol: &str) {
        let symbol = symbol.to_uppercase();
        self.misses.remove(&symbol);
        self.halted.remove(&symbol);
    }
}
