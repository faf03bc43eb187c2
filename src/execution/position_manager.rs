use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::Settings;
use crate::models::{ClosedPosition, ExitReason, Position, PositionState, TrailingMode};
use crate::{Result, TpslError};

/// Sole in-memory owner of position records
///
/// Every mutation validates first and only then touches state, so a
/// rejected call leaves the record exactly as it was.
#[derive(Debug)]
pub struct PositionManager {
    positions: Vec<Position>, // OPEN and CLOSING
    closed: Vec<ClosedPosition>,
    archive_limit: usize,
    total_pnl: f64,
}

impl PositionManager {
    pub fn new(archive_limit: usize) -> Self {
        Self {
            positions: Vec::new(),
            closed: Vec::new(),
            archive_limit,
            total_pnl: 0.0,
        }
    }

    /// Create PositionManager and restore from a loaded snapshot
    ///
    /// `realized_pnl` is the persisted running total; snapshots without one
    /// fall back to summing the archive.
    pub fn with_positions(
        archive_limit: usize,
        positions: Vec<Position>,
        closed: Vec<ClosedPosition>,
        realized_pnl: Option<f64>,
    ) -> Self {
        let total_pnl = realized_pnl.unwrap_or_else(|| closed.iter().map(|c| c.pnl).sum());
        let positions: Vec<Position> = positions
            .into_iter()
            .filter(|p| p.state != PositionState::Closed)
            .collect();

        tracing::info!(
            "Restored {} active positions, {} archived (total P&L: {:.2})",
            positions.len(),
            closed.len(),
            total_pnl
        );

        let mut pm = Self {
            positions,
            closed,
            archive_limit,
            total_pnl,
        };
        pm.trim_archive();
        pm
    }

    /// Create new position with SL/TP derived from settings
    pub fn open_position(
        &mut self,
        symbol: &str,
        entry_price: f64,
        quantity: f64,
        mode: TrailingMode,
        settings: &Settings,
    ) -> Result<Position> {
        self.open_position_at(symbol, entry_price, quantity, mode, settings, Utc::now())
    }

    /// Create new position with explicit open time
    pub fn open_position_at(
        &mut self,
        symbol: &str,
        entry_price: f64,
        quantity: f64,
        mode: TrailingMode,
        settings: &Settings,
        opened_at: DateTime<Utc>,
    ) -> Result<Position> {
        let symbol = symbol.to_uppercase();

        if !(entry_price.is_finite() && entry_price > 0.0) {
            return Err(TpslError::InvalidLevel(format!(
                "{}: entry price must be positive, got {}",
                symbol, entry_price
            )));
        }
        if !(quantity.is_finite() && quantity > 0.0) {
            return Err(TpslError::InvalidLevel(format!(
                "{}: quantity must be positive, got {}",
                symbol, quantity
            )));
        }
        if self.get(&symbol).is_some() {
            return Err(TpslError::AlreadyOpen(symbol));
        }

        let position = Position {
            id: Uuid::new_v4(),
            symbol,
            entry_price,
            quantity,
            max_price_seen: entry_price,
            tp_price: entry_price * (1.0 + settings.take_profit_pct),
            sl_price: entry_price * (1.0 - settings.stop_loss_pct),
            trailing_active: false,
            break_even_done: false,
            mode,
            state: PositionState::Open,
            opened_at,
            exit_reason: None,
            closing_since: None,
        };

        tracing::info!(
            symbol = %position.symbol,
            entry = position.entry_price,
            qty = position.quantity,
            sl = position.sl_price,
            tp = position.tp_price,
            mode = %position.mode,
            "Opened position"
        );

        self.positions.push(position.clone());
        Ok(position)
    }

    /// Position (OPEN or CLOSING) for symbol
    pub fn get(&self, symbol: &str) -> Option<&Position> {
        let symbol = symbol.to_uppercase();
        self.positions.iter().find(|p| p.symbol == symbol)
    }

    fn get_mut(&mut self, symbol: &str) -> Result<&mut Position> {
        let symbol = symbol.to_uppercase();
        self.positions
            .iter_mut()
            .find(|p| p.symbol == symbol)
            .ok_or(TpslError::UnknownPosition(symbol))
    }

    fn get_open_mut(&mut self, symbol: &str) -> Result<&mut Position> {
        let position = self.get_mut(symbol)?;
        if position.state != PositionState::Open {
            return Err(TpslError::NotOpen(position.symbol.clone()));
        }
        Ok(position)
    }

    pub fn has_open_position(&self, symbol: &str) -> bool {
        self.get(symbol).map(|p| p.is_open()).unwrap_or(false)
    }

    /// Raise the peak price; lower observations and non-OPEN positions are ignored
    pub fn update_max_price(&mut self, symbol: &str, observed_price: f64) {
        let Ok(position) = self.get_open_mut(symbol) else {
            return;
        };
        if observed_price.is_finite() && observed_price > position.max_price_seen {
            position.max_price_seen = observed_price;
        }
    }

    /// Replace TP/SL levels; the stop may only move up
    pub fn update_tp_sl(&mut self, symbol: &str, new_tp: f64, new_sl: f64) -> Result<()> {
        let position = self.get_open_mut(symbol)?;

        if !(new_tp.is_finite() && new_tp > 0.0 && new_sl.is_finite() && new_sl > 0.0) {
            return Err(TpslError::InvalidLevel(format!(
                "{}: levels must be positive (tp={}, sl={})",
                position.symbol, new_tp, new_sl
            )));
        }
        if new_sl < position.sl_price {
            return Err(TpslError::InvalidLevel(format!(
                "{}: stop cannot move down ({} -> {})",
                position.symbol, position.sl_price, new_sl
            )));
        }
        if new_sl > new_tp {
            return Err(TpslError::InvalidLevel(format!(
                "{}: stop {} above target {}",
                position.symbol, new_sl, new_tp
            )));
        }

        position.tp_price = new_tp;
        position.sl_price = new_sl;
        Ok(())
    }

    /// Switch trailing on; returns true if it was not active before
    pub fn activate_trailing(&mut self, symbol: &str) -> Result<bool> {
        let position = self.get_open_mut(symbol)?;
        let activated = !position.trailing_active;
        position.trailing_active = true;
        Ok(activated)
    }

    /// Record that the one-time break-even move happened
    pub fn mark_break_even(&mut self, symbol: &str) -> Result<()> {
        let position = self.get_open_mut(symbol)?;
        position.break_even_done = true;
        Ok(())
    }

    /// OPEN -> CLOSING; repeated calls on a CLOSING position are no-ops
    pub fn mark_closing(
        &mut self,
        symbol: &str,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let position = self.get_mut(symbol)?;

        if position.state == PositionState::Closing {
            return Ok(());
        }

        position.state = PositionState::Closing;
        position.exit_reason = Some(reason);
        position.closing_since = Some(now);

        tracing::info!(symbol = %position.symbol, reason = %reason, "Position closing");
        Ok(())
    }

    /// CLOSING -> CLOSED; archives the record and returns it
    pub fn mark_closed(
        &mut self,
        symbol: &str,
        fill_price: f64,
        now: DateTime<Utc>,
    ) -> Result<ClosedPosition> {
        let symbol = symbol.to_uppercase();
        let index = self
            .positions
            .iter()
            .position(|p| p.symbol == symbol)
            .ok_or_else(|| TpslError::UnknownPosition(symbol.clone()))?;

        if self.positions[index].state != PositionState::Closing {
            return Err(TpslError::NotClosing(symbol));
        }
        if !(fill_price.is_finite() && fill_price > 0.0) {
            return Err(TpslError::InvalidLevel(format!(
                "{}: fill price must be positive, got {}",
                symbol, fill_price
            )));
        }

        let position = self.positions.remove(index);
        let pnl = position.unrealized_pnl(fill_price);
        let closed = ClosedPosition {
            id: position.id,
            symbol: position.symbol,
            entry_price: position.entry_price,
            quantity: position.quantity,
            fill_price,
            pnl,
            pnl_pct: (fill_price - position.entry_price) / position.entry_price,
            opened_at: position.opened_at,
            closed_at: now,
            duration_secs: (now - position.opened_at).num_seconds(),
            exit_reason: position.exit_reason,
            state: PositionState::Closed,
        };

        self.total_pnl += pnl;
        self.closed.push(closed.clone());
        self.trim_archive();

        tracing::info!(
            symbol = %closed.symbol,
            fill = fill_price,
            pnl = pnl,
            "Position closed"
        );

        Ok(closed)
    }

    fn trim_archive(&mut self) {
        if self.closed.len() > self.archive_limit {
            let excess = self.closed.len() - self.archive_limit;
            self.closed.drain(..excess);
        }
    }

    /// Positions in OPEN state
    pub fn open_positions(&self) -> Vec<&Position> {
        self.positions.iter().filter(|p| p.is_open()).collect()
    }

    /// Positions in OPEN or CLOSING state
    pub fn active_positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn closed_positions(&self) -> &[ClosedPosition] {
        &self.closed
    }

    pub fn snapshot(&self) -> Vec<Position> {
        self.positions.clone()
    }

    /// Total realized P&L over the archive
    pub fn total_pnl(&self) -> f64 {
        self.total_pnl
    }
}
