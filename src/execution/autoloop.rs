//! TPSL autoloop.
//!
//! [`TpslCore`] holds every piece of mutable TPSL state and makes all
//! per-tick decisions synchronously from a set of quotes. [`AutoLoop`] is the
//! tokio task that owns the core: it fetches prices, applies commands between
//! ticks, forwards intents and publishes [`LoopStatus`] on a watch channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

use super::executor::{ExecutionSink, Intent};
use super::position_manager::PositionManager;
use super::price_cache::PriceCache;
use super::price_feed::{fetch_price, PriceSource};
use crate::config::{Settings, SettingsSource, MAX_INTERVAL_SECS};
use crate::indicators::{VolBucket, VolatilityEstimator};
use crate::models::{ClosedPosition, ExitReason, LoopState, Position, PositionState, TrailingMode};
use crate::persistence::{EventLog, LoadOutcome, PersistedState, StateManager, TpslEvent};
use crate::risk::{MissOutcome, StaleDataBreaker};
use crate::{Result, TpslError};

const COMMAND_QUEUE_SIZE: usize = 64;

/// External permission for automated exits (e.g. a UI safety switch)
pub trait PermissionGate: Send + Sync {
    fn automation_enabled(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysEnabled;

impl PermissionGate for AlwaysEnabled {
    fn automation_enabled(&self) -> bool {
        true
    }
}

impl PermissionGate for Arc<AtomicBool> {
    fn automation_enabled(&self) -> bool {
        self.load(Ordering::Relaxed)
    }
}

/// Why the loop is PAUSED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseCause {
    /// Pause command; needs Resume
    Manual,
    /// `enabled = false` in settings
    Disabled,
    /// Permission gate closed
    PermissionDenied,
}

impl PauseCause {
    fn reason(&self) -> &'static str {
        match self {
            PauseCause::Manual => "manual pause",
            PauseCause::Disabled => "disabled in settings",
            PauseCause::PermissionDenied => "automation not permitted",
        }
    }
}

/// Requests to the loop, applied between ticks
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Pause,
    Resume,
    Shutdown,
    PositionOpened {
        symbol: String,
        entry_price: f64,
        quantity: f64,
    },
    /// Exit fill confirmed by the execution collaborator
    PositionClosed { symbol: String, fill_price: f64 },
}

/// Read-only view published after every tick and command
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoopStatus {
    pub state: LoopState,
    pub pause_cause: Option<PauseCause>,
    pub positions: Vec<Position>,
    pub closed_count: usize,
    pub total_pnl: f64,
    pub stale_symbols: Vec<String>,
    pub last_tick: Option<DateTime<Utc>>,
    pub persistence_ok: bool,
}

/// TPSL state and per-tick decision logic
pub struct TpslCore {
    positions: PositionManager,
    cache: PriceCache,
    state_manager: StateManager,
    events: EventLog,
    breaker: StaleDataBreaker,
    last_buckets: HashMap<String, VolBucket>,
    state: LoopState,
    manual_pause: bool,
    auto_pause: Option<PauseCause>,
    persistence_ok: bool,
    restored: bool,
    last_tick: Option<DateTime<Utc>>,
}

impl TpslCore {
    pub fn new(state_manager: StateManager, events: EventLog, settings: &Settings) -> Self {
        Self {
            positions: PositionManager::new(settings.archive_limit),
            cache: PriceCache::new(settings.price_cache_capacity),
            state_manager,
            events,
            breaker: StaleDataBreaker::new(settings.max_consecutive_misses),
            last_buckets: HashMap::new(),
            state: LoopState::Stopped,
            manual_pause: false,
            auto_pause: None,
            persistence_ok: true,
            restored: false,
            last_tick: None,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn cache(&self) -> &PriceCache {
        &self.cache
    }

    pub fn breaker(&self) -> &StaleDataBreaker {
        &self.breaker
    }

    pub fn pause_cause(&self) -> Option<PauseCause> {
        if self.state != LoopState::Paused {
            None
        } else if self.manual_pause {
            Some(PauseCause::Manual)
        } else {
            self.auto_pause
        }
    }

    pub fn status(&self) -> LoopStatus {
        LoopStatus {
            state: self.state,
            pause_cause: self.pause_cause(),
            positions: self.positions.snapshot(),
            closed_count: self.positions.closed_positions().len(),
            total_pnl: self.positions.total_pnl(),
            stale_symbols: self.breaker.halted_symbols(),
            last_tick: self.last_tick,
            persistence_ok: self.persistence_ok,
        }
    }

    /// Symbols whose price the next tick needs (OPEN and CLOSING)
    pub fn tracked_symbols(&self) -> Vec<String> {
        self.positions
            .active_positions()
            .iter()
            .map(|p| p.symbol.clone())
            .collect()
    }

    /// STOPPED -> RUNNING, restoring the last snapshot first
    pub fn start(&mut self, settings: &Settings) {
        if self.state != LoopState::Stopped {
            tracing::debug!(state = %self.state, "Start ignored, loop already started");
            return;
        }
        self.restore(settings);
        self.manual_pause = false;
        let target = self.active_state();
        self.transition(target, "start");
    }

    /// Manual pause; only Resume lifts it
    pub fn pause(&mut self) {
        match self.state {
            LoopState::Running | LoopState::Degraded => {
                self.manual_pause = true;
                self.transition(LoopState::Paused, PauseCause::Manual.reason());
            }
            LoopState::Paused => self.manual_pause = true,
            LoopState::Stopped => tracing::debug!("Pause ignored, loop stopped"),
        }
    }

    /// Lift a manual pause; an automatic cause still holds the loop PAUSED
    pub fn resume(&mut self) {
        self.manual_pause = false;
        if self.state != LoopState::Paused {
            return;
        }
        match self.auto_pause {
            None => {
                let target = self.active_state();
                self.transition(target, "resume");
            }
            Some(cause) => {
                tracing::info!(cause = cause.reason(), "Resume requested, still paused");
            }
        }
    }

    /// Final save, then STOPPED
    pub fn shutdown(&mut self, settings: &Settings, now: DateTime<Utc>) {
        if self.state == LoopState::Stopped {
            return;
        }
        if let Err(e) = self.state_manager.save(&self.persisted_state(settings, now)) {
            tracing::error!(error = %e, "Final state save failed");
        }
        self.transition(LoopState::Stopped, "shutdown");
    }

    /// Put a freshly filled entry under TPSL management
    pub fn register_position(
        &mut self,
        symbol: &str,
        entry_price: f64,
        quantity: f64,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Result<Position> {
        self.restore(settings);

        let position = self.positions.open_position_at(
            symbol,
            entry_price,
            quantity,
            settings.mode,
            settings,
            now,
        )?;

        self.events.emit_at(
            TpslEvent::PositionOpened {
                symbol: position.symbol.clone(),
                entry_price,
                quantity,
            },
            now,
        );
        self.persist(settings, now);
        Ok(position)
    }

    /// CLOSING -> CLOSED on a confirmed exit fill
    pub fn confirm_fill(
        &mut self,
        symbol: &str,
        fill_price: f64,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Result<ClosedPosition> {
        self.restore(settings);

        let closed = self.positions.mark_closed(symbol, fill_price, now)?;
        self.breaker.forget(&closed.symbol);
        self.last_buckets.remove(&closed.symbol);
        self.cache.clear(&closed.symbol);

        self.events.emit_at(
            TpslEvent::PositionClosed {
                symbol: closed.symbol.clone(),
                pnl: closed.pnl,
                duration: closed.duration_secs,
            },
            now,
        );
        self.persist(settings, now);
        Ok(closed)
    }

    /// One tick over the given quotes; returns the intents to dispatch
    ///
    /// A symbol missing from `quotes` counts as a missed price.
    pub fn apply_tick(
        &mut self,
        quotes: &HashMap<String, Result<f64>>,
        settings: &Settings,
        automation_enabled: bool,
        now: DateTime<Utc>,
    ) -> Vec<Intent> {
        if self.state == LoopState::Stopped {
            return Vec::new();
        }

        self.breaker.set_threshold(settings.max_consecutive_misses);
        self.update_pause(settings, automation_enabled);

        for (symbol, quote) in quotes {
            if let Ok(price) = quote {
                self.cache.record(symbol, *price, now);
                if self.breaker.record_hit(symbol) {
                    tracing::info!(symbol = %symbol, "Fresh price, trailing resumed");
                }
            }
        }

        if self.state == LoopState::Paused {
            self.warn_paused_breaches(quotes);
            self.last_tick = Some(now);
            return Vec::new();
        }

        let mut intents = Vec::new();
        let degraded = self.state == LoopState::Degraded;

        for symbol in self.tracked_symbols() {
            let Some(position) = self.positions.get(&symbol) else {
                continue;
            };

            if position.state == PositionState::Closing {
                intents.push(Intent::StartExit {
                    symbol: symbol.clone(),
                    reason: position.exit_reason.unwrap_or(ExitReason::Manual),
                });
                continue;
            }

            let price = match quotes.get(&symbol) {
                Some(Ok(price)) => *price,
                Some(Err(e)) => {
                    self.record_miss(&symbol, &e.to_string(), &mut intents, now);
                    continue;
                }
                None => {
                    self.record_miss(&symbol, "no quote", &mut intents, now);
                    continue;
                }
            };

            self.positions.update_max_price(&symbol, price);

            if !degraded {
                self.adjust_levels(&symbol, price, settings, now);
            }

            if let Some(intent) = self.check_exit(&symbol, price, settings, now) {
                intents.push(intent);
            }
        }

        self.last_tick = Some(now);
        self.persist(settings, now);
        intents
    }

    fn record_miss(
        &mut self,
        symbol: &str,
        reason: &str,
        intents: &mut Vec<Intent>,
        now: DateTime<Utc>,
    ) {
        match self.breaker.record_miss(symbol) {
            MissOutcome::Counted(misses) => {
                tracing::warn!(symbol = %symbol, misses, reason = %reason, "Price unavailable, symbol skipped");
            }
            MissOutcome::Tripped(misses) => {
                self.events.emit_at(
                    TpslEvent::ErrorHalt {
                        error_code: "STALE_PRICE".to_string(),
                        context: format!(
                            "{}: {} consecutive missed prices ({})",
                            symbol, misses, reason
                        ),
                    },
                    now,
                );
                intents.push(Intent::StaleData {
                    symbol: symbol.to_string(),
                    consecutive_misses: misses,
                });
            }
            MissOutcome::StillHalted(misses) => {
                tracing::debug!(symbol = %symbol, misses, "Still no price");
            }
        }
    }

    /// Trailing activation, trailing raise and break-even
    fn adjust_levels(&mut self, symbol: &str, price: f64, settings: &Settings, now: DateTime<Utc>) {
        let Some(position) = self.positions.get(symbol).cloned() else {
            return;
        };
        let gain = position.gain_pct(price);
        let distance = self.trailing_distance(symbol, position.mode, settings);

        let mut trailing_active = position.trailing_active;
        if !trailing_active && gain >= settings.trailing_start_pct {
            match self.positions.activate_trailing(symbol) {
                Ok(_) => {
                    trailing_active = true;
                    tracing::info!(symbol = %symbol, gain = gain, distance = distance, "Trailing activated");
                }
                Err(e) => tracing::warn!(symbol = %symbol, error = %e, "Trailing activation rejected"),
            }
        }

        if trailing_active {
            let Some(current) = self.positions.get(symbol) else {
                return;
            };
            let peak = current.max_price_seen;
            let new_sl = current.sl_price.max(peak * (1.0 - distance));
            let new_tp = current.tp_price.max(peak * (1.0 + distance));

            if new_sl > current.sl_price || new_tp > current.tp_price {
                let raised_stop = new_sl > current.sl_price;
                match self.positions.update_tp_sl(symbol, new_tp, new_sl) {
                    Ok(()) if raised_stop => self.events.emit_at(
                        TpslEvent::TrailingUpdated {
                            symbol: symbol.to_string(),
                            peak_price: peak,
                            stop_price: new_sl,
                        },
                        now,
                    ),
                    Ok(()) => {}
                    Err(e) => tracing::warn!(symbol = %symbol, error = %e, "Trailing update rejected"),
                }
            }
        }

        if settings.break_even_enabled
            && !position.break_even_done
            && gain >= settings.break_even_trigger_pct
        {
            let Some(current) = self.positions.get(symbol) else {
                return;
            };
            let (tp, sl) = (current.tp_price, current.sl_price);
            let new_sl = sl.max(position.entry_price);

            let result = if new_sl > sl {
                self.positions.update_tp_sl(symbol, tp, new_sl)
            } else {
                Ok(())
            };

            match result.and_then(|_| self.positions.mark_break_even(symbol)) {
                Ok(()) => {
                    if new_sl > sl {
                        self.events.emit_at(
                            TpslEvent::BreakEven {
                                symbol: symbol.to_string(),
                                stop_price: new_sl,
                            },
                            now,
                        );
                    }
                }
                Err(e) => tracing::warn!(symbol = %symbol, error = %e, "Break-even rejected"),
            }
        }
    }

    fn trailing_distance(&mut self, symbol: &str, mode: TrailingMode, settings: &Settings) -> f64 {
        match mode {
            TrailingMode::Static => settings.trailing_distance_pct,
            TrailingMode::Dynamic => {
                let estimator =
                    VolatilityEstimator::new(settings.vol_window_sec, settings.vol_high_threshold_pct);
                let bucket = match estimator.assess(&self.cache, symbol) {
                    Some(bucket) => {
                        self.last_buckets.insert(symbol.to_string(), bucket);
                        bucket
                    }
                    // Hold the last known bucket over thin data
                    None => self
                        .last_buckets
                        .get(symbol)
                        .copied()
                        .unwrap_or_else(|| estimator.classify(&self.cache, symbol)),
                };
                match bucket {
                    VolBucket::Low => settings.trailing_distance_pct_low_vol,
                    VolBucket::High => settings.trailing_distance_pct_high_vol,
                }
            }
        }
    }

    /// First matching exit wins: hard SL, TP, trailing stop, time stop
    fn check_exit(
        &mut self,
        symbol: &str,
        price: f64,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Option<Intent> {
        let position = self.positions.get(symbol)?;

        let held_secs = (now - position.opened_at).num_seconds();
        let reason = if !position.trailing_active && price <= position.sl_price {
            ExitReason::StopLoss
        } else if price >= position.tp_price {
            ExitReason::TakeProfit
        } else if position.trailing_active && price <= position.sl_price {
            ExitReason::TrailingStop
        } else if settings
            .max_hold_secs
            .is_some_and(|max| held_secs >= 0 && held_secs as u64 >= max)
        {
            ExitReason::TimeStop
        } else {
            return None;
        };

        tracing::info!(
            symbol = %symbol,
            price = price,
            sl = position.sl_price,
            tp = position.tp_price,
            reason = %reason,
            "Exit triggered"
        );

        if let Err(e) = self.positions.mark_closing(symbol, reason, now) {
            tracing::warn!(symbol = %symbol, error = %e, "Could not mark position closing");
            return None;
        }

        self.events.emit_at(
            TpslEvent::ExitStarted {
                symbol: symbol.to_string(),
                reason,
            },
            now,
        );

        let symbol = symbol.to_string();
        Some(match reason {
            ExitReason::StopLoss => Intent::EmergencyExit { symbol, reason },
            _ => Intent::StartExit { symbol, reason },
        })
    }

    fn warn_paused_breaches(&self, quotes: &HashMap<String, Result<f64>>) {
        for position in self.positions.open_positions() {
            let Some(Ok(price)) = quotes.get(&position.symbol) else {
                continue;
            };
            if *price <= position.sl_price || *price >= position.tp_price {
                tracing::warn!(
                    symbol = %position.symbol,
                    price = *price,
                    sl = position.sl_price,
                    tp = position.tp_price,
                    "Level breached while paused, no action taken"
                );
            }
        }
    }

    fn update_pause(&mut self, settings: &Settings, automation_enabled: bool) {
        self.auto_pause = if !settings.enabled {
            Some(PauseCause::Disabled)
        } else if !automation_enabled {
            Some(PauseCause::PermissionDenied)
        } else {
            None
        };

        match (self.state, self.auto_pause) {
            (LoopState::Running | LoopState::Degraded, Some(cause)) => {
                self.transition(LoopState::Paused, cause.reason());
            }
            (LoopState::Paused, None) if !self.manual_pause => {
                let target = self.active_state();
                self.transition(target, "automatic pause cleared");
            }
            _ => {}
        }
    }

    fn active_state(&self) -> LoopState {
        if self.persistence_ok {
            LoopState::Running
        } else {
            LoopState::Degraded
        }
    }

    fn transition(&mut self, to: LoopState, reason: &str) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        self.events.emit(TpslEvent::StateTransition {
            from,
            to,
            reason: reason.to_string(),
        });
    }

    fn restore(&mut self, settings: &Settings) {
        if self.restored {
            return;
        }
        self.restored = true;

        let state = match self.state_manager.load_detailed() {
            LoadOutcome::Loaded(state) => state,
            LoadOutcome::Migrated {
                state,
                from_version,
            } => {
                self.events.emit(TpslEvent::RecoveryWarning {
                    reason: format!("state migrated from schema version {}", from_version),
                });
                state
            }
            LoadOutcome::Missing => return,
            LoadOutcome::Invalid(reason) => {
                self.events.emit(TpslEvent::RecoveryWarning {
                    reason: format!("corrupt state quarantined: {}", reason),
                });
                return;
            }
            LoadOutcome::Unreadable(reason) => {
                self.events.emit(TpslEvent::RecoveryWarning {
                    reason: format!("state unreadable: {}", reason),
                });
                return;
            }
        };

        let closing = state
            .positions
            .iter()
            .filter(|p| p.state == PositionState::Closing)
            .count();
        if closing > 0 {
            self.events.emit(TpslEvent::RecoveryWarning {
                reason: format!(
                    "{} position(s) were closing at shutdown, exit intents will be re-sent",
                    closing
                ),
            });
        }

        self.positions = PositionManager::with_positions(
            settings.archive_limit,
            state.positions,
            state.closed_positions,
            state.realized_pnl,
        );
        self.last_tick = Some(state.last_tick_ts);
    }

    fn persisted_state(&self, settings: &Settings, now: DateTime<Utc>) -> PersistedState {
        PersistedState {
            positions: self.positions.snapshot(),
            closed_positions: self.positions.closed_positions().to_vec(),
            realized_pnl: Some(self.positions.total_pnl()),
            last_tick_ts: now,
            ..PersistedState::new(settings.mode, settings.enabled)
        }
    }

    fn persist(&mut self, settings: &Settings, now: DateTime<Utc>) {
        match self.state_manager.save(&self.persisted_state(settings, now)) {
            Ok(()) => {
                self.persistence_ok = true;
                if self.state == LoopState::Degraded {
                    self.transition(LoopState::Running, "state saved");
                }
            }
            Err(e) => {
                let first_failure = self.persistence_ok;
                self.persistence_ok = false;
                if first_failure {
                    self.events.emit_at(
                        TpslEvent::ErrorHalt {
                            error_code: e.code().to_string(),
                            context: e.to_string(),
                        },
                        now,
                    );
                }
                if self.state == LoopState::Running {
                    self.transition(LoopState::Degraded, "state save failed");
                }
            }
        }
    }
}

/// Handle for talking to a running [`AutoLoop`]
#[derive(Clone)]
pub struct LoopHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<LoopStatus>,
}

impl LoopHandle {
    pub async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|e| TpslError::ExecutionRejected(format!("loop not running: {:?}", e.0)))
    }

    pub async fn start(&self) -> Result<()> {
        self.send(Command::Start).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send(Command::Resume).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }

    pub async fn position_opened(&self, symbol: &str, entry_price: f64, quantity: f64) -> Result<()> {
        self.send(Command::PositionOpened {
            symbol: symbol.to_string(),
            entry_price,
            quantity,
        })
        .await
    }

    pub async fn position_closed(&self, symbol: &str, fill_price: f64) -> Result<()> {
        self.send(Command::PositionClosed {
            symbol: symbol.to_string(),
            fill_price,
        })
        .await
    }

    /// Latest published status
    pub fn status(&self) -> LoopStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoopStatus> {
        self.status.clone()
    }
}

/// Tokio task owning a [`TpslCore`]
pub struct AutoLoop<P, E, S, G> {
    core: TpslCore,
    prices: P,
    executor: E,
    settings: S,
    gate: G,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<LoopStatus>,
}

impl<P, E, S, G> AutoLoop<P, E, S, G>
where
    P: PriceSource,
    E: ExecutionSink,
    S: SettingsSource,
    G: PermissionGate,
{
    pub fn new(core: TpslCore, prices: P, executor: E, settings: S, gate: G) -> (Self, LoopHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (status_tx, status_rx) = watch::channel(core.status());

        let autoloop = Self {
            core,
            prices,
            executor,
            settings,
            gate,
            commands: command_rx,
            status: status_tx,
        };
        let handle = LoopHandle {
            commands: command_tx,
            status: status_rx,
        };
        (autoloop, handle)
    }

    pub fn core(&self) -> &TpslCore {
        &self.core
    }

    /// Run until Shutdown (or every handle dropped); returns the core
    pub async fn run(mut self) -> TpslCore {
        let mut period = tick_period(&self.settings.load_settings());
        let mut ticker = interval(Duration::from_secs(period));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval_sec = period, "TPSL autoloop task started");

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => {
                            let settings = self.settings.load_settings();
                            self.core.shutdown(&settings, Utc::now());
                            self.publish();
                            break;
                        }
                        Some(command) => {
                            self.handle_command(command);
                            self.publish();
                        }
                    }
                }

                _ = ticker.tick() => {
                    let settings = self.tick().await;
                    let wanted = tick_period(&settings);
                    if wanted != period {
                        tracing::info!(from = period, to = wanted, "Tick interval changed");
                        period = wanted;
                        let every = Duration::from_secs(period);
                        ticker = interval_at(Instant::now() + every, every);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }
            }
        }

        tracing::info!("TPSL autoloop task stopped");
        self.core
    }

    /// Fetch prices for tracked symbols and apply one tick
    pub async fn tick(&mut self) -> Settings {
        let settings = self.settings.load_settings();
        if self.core.state() == LoopState::Stopped {
            return settings;
        }

        let timeout = Duration::from_millis(settings.price_timeout_ms);
        let mut quotes = HashMap::new();
        for symbol in self.core.tracked_symbols() {
            let quote = fetch_price(&self.prices, &symbol, timeout).await;
            quotes.insert(symbol, quote);
        }

        let automation_enabled = self.gate.automation_enabled();
        let intents = self
            .core
            .apply_tick(&quotes, &settings, automation_enabled, Utc::now());

        for intent in intents {
            let symbol = intent.symbol().to_string();
            if let Err(e) = self.executor.submit(intent) {
                tracing::error!(symbol = %symbol, error = %e, "Intent not delivered");
            }
        }

        self.publish();
        settings
    }

    fn handle_command(&mut self, command: Command) {
        let settings = self.settings.load_settings();
        let now = Utc::now();

        match command {
            Command::Start => self.core.start(&settings),
            Command::Pause => self.core.pause(),
            Command::Resume => self.core.resume(),
            Command::Shutdown => self.core.shutdown(&settings, now),
            Command::PositionOpened {
                symbol,
                entry_price,
                quantity,
            } => {
                if let Err(e) =
                    self.core
                        .register_position(&symbol, entry_price, quantity, &settings, now)
                {
                    tracing::warn!(symbol = %symbol, error = %e, "Position registration rejected");
                }
            }
            Command::PositionClosed { symbol, fill_price } => {
                if let Err(e) = self.core.confirm_fill(&symbol, fill_price, &settings, now) {
                    tracing::warn!(symbol = %symbol, error = %e, "Fill confirmation rejected");
                }
            }
        }
    }

    fn publish(&self) {
        self.status.send_replace(self.core.status());
    }
}

/// Tick period in seconds, kept within what the timer can schedule
fn tick_period(settings: &Settings) -> u64 {
    settings.interval_sec.clamp(1, MAX_INTERVAL_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn settings() -> Settings {
        Settings {
            mode: TrailingMode::Static,
            stop_loss_pct: 0.02,
            take_profit_pct: 0.10,
            trailing_start_pct: 0.05,
            trailing_distance_pct: 0.02,
            break_even_enabled: false,
            ..Settings::default()
        }
    }

    fn quotes(prices: &[(&str, f64)]) -> HashMap<String, Result<f64>> {
        prices
            .iter()
            .map(|(s, p)| (s.to_string(), Ok(*p)))
            .collect()
    }

    fn missing(symbol: &str) -> HashMap<String, Result<f64>> {
        let mut q = HashMap::new();
        q.insert(
            symbol.to_string(),
            Err(TpslError::data_unavailable(symbol, "timeout")),
        );
        q
    }

    struct Fixture {
        core: TpslCore,
        events: std::path::PathBuf,
        _dir: tempfile::TempDir,
    }

    fn fixture(settings: &Settings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let events = dir.path().join("events.jsonl");
        let mut core = TpslCore::new(
            StateManager::new(dir.path().join("state.json")),
            EventLog::new(Some(events.clone())),
            settings,
        );
        core.start(settings);
        Fixture {
            core,
            events,
            _dir: dir,
        }
    }

    fn event_names(path: &std::path::Path) -> Vec<&'static str> {
        EventLog::read(path)
            .unwrap()
            .into_iter()
            .map(|r| r.event.name())
            .collect()
    }

    #[test]
    fn test_trailing_activates_and_raises_stop() {
        let s = settings();
        let mut f = fixture(&s);
        f.core.register_position("BTCUSDT", 100.0, 1.0, &s, at(0)).unwrap();

        let intents = f.core.apply_tick(&quotes(&[("BTCUSDT", 106.0)]), &s, true, at(5));
        assert!(intents.is_empty());

        let p = f.core.positions().get("BTCUSDT").unwrap();
        assert!(p.trailing_active);
        assert!((p.sl_price - 103.88).abs() < 1e-9);
        assert!(p.tp_price >= 106.0 * 1.02 - 1e-9);
        assert!(event_names(&f.events).contains(&"trailing_updated"));
    }

    #[test]
    fn test_stop_never_moves_down_then_trailing_exit() {
        let s = settings();
        let mut f = fixture(&s);
        f.core.register_position("BTCUSDT", 100.0, 1.0, &s, at(0)).unwrap();
        f.core.apply_tick(&quotes(&[("BTCUSDT", 106.0)]), &s, true, at(5));

        let intents = f.core.apply_tick(&quotes(&[("BTCUSDT", 103.0)]), &s, true, at(10));

        let p = f.core.positions().get("BTCUSDT").unwrap();
        assert!((p.sl_price - 103.88).abs() < 1e-9);
        assert_eq!(p.state, PositionState::Closing);
        assert_eq!(
            intents,
            vec![Intent::StartExit {
                symbol: "BTCUSDT".to_string(),
                reason: ExitReason::TrailingStop,
            }]
        );
    }

    #[test]
    fn test_break_even_before_trailing() {
        let s = Settings {
            break_even_enabled: true,
            break_even_trigger_pct: 0.04,
            trailing_start_pct: 0.08,
            ..settings()
        };
        let mut f = fixture(&s);
        f.core.register_position("ETHUSDT", 100.0, 1.0, &s, at(0)).unwrap();

        f.core.apply_tick(&quotes(&[("ETHUSDT", 104.0)]), &s, true, at(5));

        let p = f.core.positions().get("ETHUSDT").unwrap();
        assert!(!p.trailing_active);
        assert!(p.break_even_done);
        assert!(p.sl_price >= 100.0);
        assert!(event_names(&f.events).contains(&"break_even"));
    }

    #[test]
    fn test_hard_stop_is_emergency_exit() {
        let s = settings();
        let mut f = fixture(&s);
        f.core.register_position("SOLUSDT", 100.0, 1.0, &s, at(0)).unwrap();

        let intents = f.core.apply_tick(&quotes(&[("SOLUSDT", 97.0)]), &s, true, at(5));
        assert_eq!(
            intents,
            vec![Intent::EmergencyExit {
                symbol: "SOLUSDT".to_string(),
                reason: ExitReason::StopLoss,
            }]
        );
    }

    #[test]
    fn test_take_profit() {
        let s = settings();
        let mut f = fixture(&s);
        f.core.register_position("SOLUSDT", 100.0, 1.0, &s, at(0)).unwrap();

        // Jumps straight past TP before trailing can lift it
        let s_no_trail = Settings {
            trailing_start_pct: 0.5,
            ..s
        };
        let intents = f.core.apply_tick(&quotes(&[("SOLUSDT", 111.0)]), &s_no_trail, true, at(5));
        assert_eq!(
            intents,
            vec![Intent::StartExit {
                symbol: "SOLUSDT".to_string(),
                reason: ExitReason::TakeProfit,
            }]
        );
    }

    #[test]
    fn test_time_stop() {
        let s = Settings {
            max_hold_secs: Some(60),
            ..settings()
        };
        let mut f = fixture(&s);
        f.core.register_position("BTCUSDT", 100.0, 1.0, &s, at(0)).unwrap();

        assert!(f
            .core
            .apply_tick(&quotes(&[("BTCUSDT", 100.5)]), &s, true, at(30))
            .is_empty());
        let intents = f.core.apply_tick(&quotes(&[("BTCUSDT", 100.5)]), &s, true, at(61));
        assert_eq!(
            intents,
            vec![Intent::StartExit {
                symbol: "BTCUSDT".to_string(),
                reason: ExitReason::TimeStop,
            }]
        );
    }

    #[test]
    fn test_tick_period_stays_schedulable() {
        let mut s = settings();
        s.interval_sec = 0;
        assert_eq!(tick_period(&s), 1);
        s.interval_sec = u64::MAX;
        assert_eq!(tick_period(&s), MAX_INTERVAL_SECS);
        s.interval_sec = 5;
        assert_eq!(tick_period(&s), 5);
    }

    #[test]
    fn test_dynamic_mode_survives_oversized_window() {
        let mut s = settings();
        s.mode = TrailingMode::Dynamic;
        s.vol_window_sec = 100_000_000_000_000;
        let mut f = fixture(&s);
        f.core.register_position("SOLUSDT", 100.0, 1.0, &s, at(0)).unwrap();

        f.core.apply_tick(&quotes(&[("SOLUSDT", 104.0)]), &s, true, at(5));
        f.core.apply_tick(&quotes(&[("SOLUSDT", 106.0)]), &s, true, at(10));

        let p = &f.core.positions().active_positions()[0];
        assert!(p.trailing_active);
        assert_eq!(f.core.state(), LoopState::Running);
    }

    #[test]
    fn test_closing_position_reemits_until_confirmed() {
        let s = settings();
        let mut f = fixture(&s);
        f.core.register_position("SOLUSDT", 100.0, 2.0, &s, at(0)).unwrap();
        f.core.apply_tick(&quotes(&[("SOLUSDT", 97.0)]), &s, true, at(5));

        for tick in 2..4 {
            let intents = f.core.apply_tick(&HashMap::new(), &s, true, at(tick * 5));
            assert_eq!(
                intents,
                vec![Intent::StartExit {
                    symbol: "SOLUSDT".to_string(),
                    reason: ExitReason::StopLoss,
                }]
            );
        }

        assert!(!f.core.cache().is_empty("SOLUSDT"));
        let closed = f.core.confirm_fill("SOLUSDT", 97.0, &s, at(30)).unwrap();
        assert_eq!(closed.pnl, -6.0);
        assert_eq!(closed.duration_secs, 30);
        assert!(f.core.cache().is_empty("SOLUSDT"));
        assert!(f.core.apply_tick(&HashMap::new(), &s, true, at(35)).is_empty());
        assert!(event_names(&f.events).contains(&"position_closed"));
    }

    #[test]
    fn test_stale_symbol_escalates_once_and_others_continue() {
        let s = Settings {
            max_consecutive_misses: 3,
            ..settings()
        };
        let mut f = fixture(&s);
        f.core.register_position("BTCUSDT", 100.0, 1.0, &s, at(0)).unwrap();
        f.core.register_position("ETHUSDT", 50.0, 1.0, &s, at(0)).unwrap();

        let mut stale_intents = 0;
        for tick in 1..=4 {
            let mut q = missing("BTCUSDT");
            q.insert("ETHUSDT".to_string(), Ok(50.5));
            let intents = f.core.apply_tick(&q, &s, true, at(tick * 5));
            stale_intents += intents
                .iter()
                .filter(|i| matches!(i, Intent::StaleData { .. }))
                .count();
        }

        assert_eq!(stale_intents, 1);
        assert_eq!(f.core.breaker().halted_symbols(), vec!["BTCUSDT".to_string()]);
        assert!(f.core.positions().has_open_position("BTCUSDT"));
        assert!(f.core.positions().has_open_position("ETHUSDT"));
        assert_eq!(
            event_names(&f.events)
                .iter()
                .filter(|n| **n == "error_halt")
                .count(),
            1
        );

        f.core.apply_tick(&quotes(&[("BTCUSDT", 100.0), ("ETHUSDT", 50.5)]), &s, true, at(30));
        assert!(f.core.breaker().halted_symbols().is_empty());
    }

    #[test]
    fn test_permission_gate_pauses_without_mutation() {
        let s = settings();
        let mut f = fixture(&s);
        f.core.register_position("BTCUSDT", 100.0, 1.0, &s, at(0)).unwrap();

        let intents = f.core.apply_tick(&quotes(&[("BTCUSDT", 90.0)]), &s, false, at(5));

        assert!(intents.is_empty());
        assert_eq!(f.core.state(), LoopState::Paused);
        assert_eq!(f.core.pause_cause(), Some(PauseCause::PermissionDenied));
        let p = f.core.positions().get("BTCUSDT").unwrap();
        assert_eq!(p.state, PositionState::Open);
        assert_eq!(p.max_price_seen, 100.0);
        // Price is still cached
        assert_eq!(f.core.cache().len("BTCUSDT"), 1);

        // Cause clears, loop resumes and acts
        let intents = f.core.apply_tick(&quotes(&[("BTCUSDT", 90.0)]), &s, true, at(10));
        assert_eq!(f.core.state(), LoopState::Running);
        assert_eq!(intents.len(), 1);
    }

    #[test]
    fn test_manual_pause_needs_resume() {
        let s = settings();
        let mut f = fixture(&s);
        f.core.pause();
        f.core.apply_tick(&HashMap::new(), &s, true, at(5));
        assert_eq!(f.core.state(), LoopState::Paused);
        assert_eq!(f.core.pause_cause(), Some(PauseCause::Manual));

        f.core.resume();
        assert_eq!(f.core.state(), LoopState::Running);
    }

    #[test]
    fn test_disabled_settings_pause() {
        let s = Settings {
            enabled: false,
            ..settings()
        };
        let mut f = fixture(&s);
        f.core.apply_tick(&HashMap::new(), &s, true, at(5));
        assert_eq!(f.core.pause_cause(), Some(PauseCause::Disabled));

        // Resume cannot override the settings switch
        f.core.resume();
        assert_eq!(f.core.state(), LoopState::Paused);
    }

    #[test]
    fn test_save_failure_degrades_and_recovers() {
        let s = settings();
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let mut core = TpslCore::new(
            StateManager::new(state_dir.join("state.json")),
            EventLog::disabled(),
            &s,
        );
        core.start(&s);
        core.register_position("BTCUSDT", 100.0, 1.0, &s, at(0)).unwrap();

        // Replace the state directory with a plain file
        std::fs::remove_dir_all(&state_dir).unwrap();
        std::fs::write(&state_dir, b"blocked").unwrap();

        core.apply_tick(&quotes(&[("BTCUSDT", 106.0)]), &s, true, at(5));
        assert_eq!(core.state(), LoopState::Degraded);
        assert!(!core.status().persistence_ok);

        // No trailing commits while degraded, exits still fire
        core.apply_tick(&quotes(&[("BTCUSDT", 107.0)]), &s, true, at(10));
        let sl_before = core.positions().get("BTCUSDT").unwrap().sl_price;
        core.apply_tick(&quotes(&[("BTCUSDT", 108.0)]), &s, true, at(15));
        assert_eq!(core.positions().get("BTCUSDT").unwrap().sl_price, sl_before);

        let intents = core.apply_tick(&quotes(&[("BTCUSDT", 90.0)]), &s, true, at(20));
        assert_eq!(intents.len(), 1);

        std::fs::remove_file(&state_dir).unwrap();
        core.apply_tick(&HashMap::new(), &s, true, at(25));
        assert_eq!(core.state(), LoopState::Running);
    }

    #[test]
    fn test_dynamic_mode_holds_last_bucket() {
        let s = Settings {
            mode: TrailingMode::Dynamic,
            vol_window_sec: 20,
            trailing_start_pct: 0.01,
            ..settings()
        };
        let mut f = fixture(&s);
        f.core.register_position("BTCUSDT", 100.0, 1.0, &s, at(0)).unwrap();

        // Wide swings: HIGH bucket
        f.core.apply_tick(&quotes(&[("BTCUSDT", 100.0)]), &s, true, at(5));
        f.core.apply_tick(&quotes(&[("BTCUSDT", 103.0)]), &s, true, at(10));
        assert_eq!(f.core.last_buckets.get("BTCUSDT"), Some(&VolBucket::High));

        let p = f.core.positions().get("BTCUSDT").unwrap();
        assert!((p.sl_price - 103.0 * (1.0 - s.trailing_distance_pct_high_vol)).abs() < 1e-9);

        // Long gap leaves one sample in the window: bucket is held
        f.core.apply_tick(&quotes(&[("BTCUSDT", 103.5)]), &s, true, at(100));
        assert_eq!(f.core.last_buckets.get("BTCUSDT"), Some(&VolBucket::High));
        let p = f.core.positions().get("BTCUSDT").unwrap();
        assert!((p.sl_price - 103.5 * (1.0 - s.trailing_distance_pct_high_vol)).abs() < 1e-9);
    }

    #[test]
    fn test_restart_restores_positions() {
        let s = settings();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut core = TpslCore::new(StateManager::new(&path), EventLog::disabled(), &s);
        core.start(&s);
        core.register_position("BTCUSDT", 100.0, 1.0, &s, at(0)).unwrap();
        core.apply_tick(&quotes(&[("BTCUSDT", 106.0)]), &s, true, at(5));
        core.shutdown(&s, at(6));
        assert_eq!(core.state(), LoopState::Stopped);

        let mut restarted = TpslCore::new(StateManager::new(&path), EventLog::disabled(), &s);
        restarted.start(&s);
        let p = restarted.positions().get("BTCUSDT").unwrap();
        assert!(p.trailing_active);
        assert!((p.sl_price - 103.88).abs() < 1e-9);
        assert_eq!(restarted.status().last_tick, Some(at(6)));
    }

    #[test]
    fn test_stopped_core_ignores_ticks() {
        let s = settings();
        let dir = tempfile::tempdir().unwrap();
        let mut core = TpslCore::new(
            StateManager::new(dir.path().join("state.json")),
            EventLog::disabled(),
            &s,
        );
        assert!(core
            .apply_tick(&quotes(&[("BTCUSDT", 1.0)]), &s, true, at(0))
            .is_empty());
        assert!(!dir.path().join("state.json").exists());
    }
}
