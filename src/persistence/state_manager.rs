//! Crash-safe JSON snapshot of the TPSL state.
//!
//! Writes go to a temp file in the target directory which is flushed,
//! synced and then renamed over the canonical path. A reader sees either the
//! previous complete snapshot or the new one.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::config::Settings;
use crate::models::{ClosedPosition, Position, PositionState, TrailingMode};
use crate::{Result, TpslError};

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Ticks a running loop may miss before its snapshot counts as abandoned
const LIVE_TICK_GRACE: u64 = 3;

/// On-disk mirror of the loop state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedState {
    #[serde(default)]
    pub schema_version: u32,
    pub mode: TrailingMode,
    pub enabled: bool,
    pub positions: Vec<Position>,
    #[serde(default)]
    pub closed_positions: Vec<ClosedPosition>,
    /// Realized P&L over every close, including ones trimmed from the archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<f64>,
    pub last_tick_ts: DateTime<Utc>,
}

impl PersistedState {
    pub fn new(mode: TrailingMode, enabled: bool) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            mode,
            enabled,
            positions: Vec::new(),
            closed_positions: Vec::new(),
            realized_pnl: None,
            last_tick_ts: Utc::now(),
        }
    }

    /// Whether a running loop saved this snapshot within the last few ticks
    ///
    /// Offline edits of such a file would be overwritten by the loop's next save.
    pub fn written_by_live_loop(&self, interval_sec: u64, now: DateTime<Utc>) -> bool {
        let grace = i64::try_from(interval_sec.saturating_mul(LIVE_TICK_GRACE)).unwrap_or(i64::MAX);
        let age = now.signed_duration_since(self.last_tick_ts).num_seconds();
        (0..grace).contains(&age)
    }

    /// Check invariants a snapshot must hold to be trusted
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(format!(
                "schema version {} (expected {})",
                self.schema_version, CURRENT_SCHEMA_VERSION
            ));
        }

        if let Some(pnl) = self.realized_pnl {
            if !pnl.is_finite() {
                return Err(format!("realized_pnl is {}", pnl));
            }
        }

        let mut active = HashSet::new();
        for p in &self.positions {
            let levels = [
                ("entry_price", p.entry_price),
                ("quantity", p.quantity),
                ("max_price_seen", p.max_price_seen),
                ("tp_price", p.tp_price),
                ("sl_price", p.sl_price),
            ];
            for (name, value) in levels {
                if !(value.is_finite() && value > 0.0) {
                    return Err(format!("{}: {} is {}", p.symbol, name, value));
                }
            }
            if p.max_price_seen < p.entry_price {
                return Err(format!("{}: max_price_seen below entry", p.symbol));
            }
            if p.state != PositionState::Closed && !active.insert(p.symbol.clone()) {
                return Err(format!("duplicate active position for {}", p.symbol));
            }
        }

        Ok(())
    }
}

/// What `load` found on disk
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded(PersistedState),
    /// Older layout upgraded in memory
    Migrated {
        state: PersistedState,
        from_version: u32,
    },
    /// No state file: cold start
    Missing,
    /// File exists but could not be read (left in place)
    Unreadable(String),
    /// File failed to parse or validate (quarantined)
    Invalid(String),
}

impl LoadOutcome {
    pub fn into_state(self) -> Option<PersistedState> {
        match self {
            LoadOutcome::Loaded(state) | LoadOutcome::Migrated { state, .. } => Some(state),
            _ => None,
        }
    }
}

/// Owner of the canonical state file
#[derive(Debug, Clone)]
pub struct StateManager {
    path: PathBuf,
}

impl StateManager {
    /// No filesystem access happens until the first save or load.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Path a rejected snapshot is moved to
    pub fn quarantine_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".corrupt");
        self.path.with_file_name(name)
    }

    /// Atomically replace the state file with `state`
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| TpslError::Persistence(format!("serialize: {}", e)))?;

        let dir = self.dir();
        fs::create_dir_all(dir)?;

        // Removed on drop unless persisted
        let mut tmp = tempfile::Builder::new()
            .prefix(".tpsl-state-")
            .suffix(".tmp")
            .tempfile_in(dir)?;

        tmp.write_all(&bytes)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;

        tmp.persist(&self.path)
            .map_err(|e| TpslError::Persistence(format!("atomic rename failed: {}", e.error)))?;

        tracing::debug!(
            path = %self.path.display(),
            positions = state.positions.len(),
            "State saved"
        );
        Ok(())
    }

    /// Last good snapshot, or None on cold start / unusable file
    pub fn load(&self) -> Option<PersistedState> {
        self.load_detailed().into_state()
    }

    pub fn load_detailed(&self) -> LoadOutcome {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "State file not found, cold start");
                return LoadOutcome::Missing;
            }
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "Failed to read state file");
                return LoadOutcome::Unreadable(e.to_string());
            }
        };

        match Self::decode(&raw) {
            Ok((state, CURRENT_SCHEMA_VERSION)) => LoadOutcome::Loaded(state),
            Ok((state, from_version)) => {
                tracing::warn!(
                    path = %self.path.display(),
                    from_version,
                    to_version = CURRENT_SCHEMA_VERSION,
                    "Migrated state file"
                );
                LoadOutcome::Migrated {
                    state,
                    from_version,
                }
            }
            Err(reason) => {
                let quarantine = self.quarantine_path();
                tracing::error!(
                    path = %self.path.display(),
                    quarantine = %quarantine.display(),
                    reason = %reason,
                    "Rejecting corrupt state file"
                );
                if let Err(e) = fs::rename(&self.path, &quarantine) {
                    tracing::warn!(error = %e, "Failed to quarantine corrupt state file");
                }
                LoadOutcome::Invalid(reason)
            }
        }
    }

    /// Parse, migrate and validate; returns the state and its original version
    fn decode(raw: &[u8]) -> std::result::Result<(PersistedState, u32), String> {
        let value: Value = serde_json::from_slice(raw).map_err(|e| format!("invalid JSON: {}", e))?;
        let (migrated, from_version) = migrate(value)?;
        let state: PersistedState =
            serde_json::from_value(migrated).map_err(|e| format!("invalid layout: {}", e))?;
        state.validate()?;
        Ok((state, from_version))
    }
}

/// Upgrade a raw snapshot to the current schema
///
/// Version 0 has no `schema_version` and keys positions by symbol:
/// `{"positions": {"BTCUSDT": {"qty", "entry_price", "tp", "sl",
/// "opened_at", "stats": {"max_price", "closing"}}}, "meta": {...}}`.
pub fn migrate(value: Value) -> std::result::Result<(Value, u32), String> {
    let Value::Object(mut root) = value else {
        return Err("state root is not an object".to_string());
    };

    let version = match root.get("schema_version") {
        None => 0,
        Some(v) => v
            .as_u64()
            .ok_or_else(|| format!("schema_version is not an integer: {}", v))?
            as u32,
    };

    if version > CURRENT_SCHEMA_VERSION {
        return Err(format!(
            "unsupported schema version {} (newest known {})",
            version, CURRENT_SCHEMA_VERSION
        ));
    }

    if version == 0 {
        migrate_v0(&mut root)?;
    }

    Ok((Value::Object(root), version))
}

fn migrate_v0(root: &mut Map<String, Value>) -> std::result::Result<(), String> {
    let defaults = Settings::default();

    let positions = match root.remove("positions") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(list)) => list,
        Some(Value::Object(by_symbol)) => {
            let mut list = Vec::with_capacity(by_symbol.len());
            for (key, entry) in by_symbol {
                list.push(migrate_v0_position(&key, &entry, &defaults)?);
            }
            list
        }
        Some(other) => return Err(format!("positions has unexpected type: {}", other)),
    };

    let mode = match root.get("mode").and_then(Value::as_str) {
        Some(m) if m.eq_ignore_ascii_case("static") => "STATIC",
        Some(m) if m.eq_ignore_ascii_case("dynamic") => "DYNAMIC",
        _ => match defaults.mode {
            TrailingMode::Static => "STATIC",
            TrailingMode::Dynamic => "DYNAMIC",
        },
    };

    let last_tick = root
        .get("last_tick_ts")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            root.get("meta")
                .and_then(|m| m.get("updated_at"))
                .and_then(Value::as_f64)
                .and_then(unix_to_rfc3339)
        })
        .unwrap_or_else(|| Utc::now().to_rfc3339());

    let enabled = root.get("enabled").and_then(Value::as_bool).unwrap_or(true);

    root.remove("meta");
    root.insert("schema_version".into(), json!(CURRENT_SCHEMA_VERSION));
    root.insert("mode".into(), json!(mode));
    root.insert("enabled".into(), json!(enabled));
    root.insert("positions".into(), Value::Array(positions));
    root.insert("last_tick_ts".into(), json!(last_tick));
    root.entry("closed_positions").or_insert_with(|| json!([]));

    Ok(())
}

fn migrate_v0_position(
    key: &str,
    entry: &Value,
    defaults: &Settings,
) -> std::result::Result<Value, String> {
    let num = |names: &[&str]| names.iter().find_map(|n| entry.get(*n).and_then(Value::as_f64));

    let symbol = entry
        .get("symbol")
        .and_then(Value::as_str)
        .unwrap_or(key)
        .to_uppercase();
    let entry_price = num(&["entry_price", "entry"])
        .ok_or_else(|| format!("{}: legacy position without entry price", symbol))?;
    let quantity = num(&["quantity", "qty"])
        .ok_or_else(|| format!("{}: legacy position without quantity", symbol))?;

    let stats = entry.get("stats");
    let max_price = stats
        .and_then(|s| s.get("max_price"))
        .and_then(Value::as_f64)
        .unwrap_or(entry_price)
        .max(entry_price);
    let closing = stats
        .and_then(|s| s.get("closing"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let tp = num(&["tp_price", "tp"]).unwrap_or(entry_price * (1.0 + defaults.take_profit_pct));
    let sl = num(&["sl_price", "sl"]).unwrap_or(entry_price * (1.0 - defaults.stop_loss_pct));

    let mut migrated = json!({
        "symbol": symbol,
        "entry_price": entry_price,
        "quantity": quantity,
        "max_price_seen": max_price,
        "tp_price": tp,
        "sl_price": sl,
        "trailing_active": entry.get("trailing_active").and_then(Value::as_bool).unwrap_or(false),
        "state": if closing { "CLOSING" } else { "OPEN" },
    });

    if let Some(opened) = entry
        .get("opened_at")
        .and_then(Value::as_f64)
        .and_then(unix_to_rfc3339)
    {
        migrated["opened_at"] = json!(opened);
    }

    Ok(migrated)
}

fn unix_to_rfc3339(secs: f64) -> Option<String> {
    let millis = (secs * 1000.0) as i64;
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PositionManager;

    fn sample_state() -> PersistedState {
        let settings = Settings::default();
        let mut pm = PositionManager::new(10);
        pm.open_position("BTCUSDT", 43_000.5, 0.01, TrailingMode::Dynamic, &settings)
            .unwrap();
        pm.open_position("ETHUSDT", 2_300.25, 0.5, TrailingMode::Static, &settings)
            .unwrap();
        pm.update_max_price("BTCUSDT", 43_750.0);
        pm.activate_trailing("BTCUSDT").unwrap();

        let mut state = PersistedState::new(TrailingMode::Dynamic, true);
        state.positions = pm.snapshot();
        state
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path().join("state.json"));
        let state = sample_state();

        manager.save(&state).unwrap();
        let loaded = manager.load().unwrap();

        assert_eq!(loaded, state);
    }

    #[test]
    fn test_computed_levels_survive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path().join("state.json"));
        let settings = Settings::default();

        for i in 0..500 {
            let entry = 0.0137 + i as f64 * 7.919_3;
            let mut pm = PositionManager::new(10);
            pm.open_position("SOLUSDT", entry, 1.5, TrailingMode::Dynamic, &settings)
                .unwrap();
            let peak = entry * 1.031;
            pm.update_max_price("SOLUSDT", peak);
            pm.update_tp_sl("SOLUSDT", peak * (1.0 + 0.0035), peak * (1.0 - 0.0035))
                .unwrap();

            let mut state = PersistedState::new(TrailingMode::Dynamic, true);
            state.positions = pm.snapshot();

            manager.save(&state).unwrap();
            let loaded = manager.load().unwrap();

            assert_eq!(loaded, state, "entry {}", entry);
            assert_eq!(
                loaded.positions[0].sl_price.to_bits(),
                state.positions[0].sl_price.to_bits()
            );
        }
    }

    #[test]
    fn test_recent_tick_marks_snapshot_live() {
        let mut state = PersistedState::new(TrailingMode::Static, true);
        let now = Utc::now();

        state.last_tick_ts = now - chrono::Duration::seconds(4);
        assert!(state.written_by_live_loop(5, now));

        state.last_tick_ts = now - chrono::Duration::seconds(15);
        assert!(!state.written_by_live_loop(5, now));

        state.last_tick_ts = DateTime::<Utc>::UNIX_EPOCH;
        assert!(!state.written_by_live_loop(5, now));

        state.last_tick_ts = now;
        assert!(state.written_by_live_loop(u64::MAX, now));
    }

    #[test]
    fn test_save_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path().join("runtime").join("state.json"));

        manager.save(&sample_state()).unwrap();
        assert!(manager.path().exists());
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path().join("state.json"));

        manager.save(&sample_state()).unwrap();
        manager.save(&sample_state()).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["state.json".to_string()]);
    }

    #[test]
    fn test_save_failure_reports_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();
        let manager = StateManager::new(blocker.join("state.json"));

        let err = manager.save(&sample_state()).unwrap_err();
        assert_eq!(err.code(), "PERSISTENCE");
    }

    #[test]
    fn test_load_missing_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path().join("state.json"));

        assert_eq!(manager.load_detailed(), LoadOutcome::Missing);
        assert!(manager.load().is_none());
        // Loading never creates the file
        assert!(!manager.path().exists());
    }

    #[test]
    fn test_interrupted_write_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path().join("state.json"));
        let previous = sample_state();
        manager.save(&previous).unwrap();

        // Crash after writing half of the next snapshot to a temp file,
        // before the rename
        let mut next = previous.clone();
        next.enabled = false;
        let bytes = serde_json::to_vec_pretty(&next).unwrap();
        let mut tmp = tempfile::Builder::new()
            .prefix(".tpsl-state-")
            .suffix(".tmp")
            .tempfile_in(dir.path())
            .unwrap();
        tmp.write_all(&bytes[..bytes.len() / 2]).unwrap();
        let (_file, _leftover) = tmp.keep().unwrap();

        let loaded = manager.load().unwrap();
        assert_eq!(loaded, previous);
    }

    #[test]
    fn test_truncated_file_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path().join("state.json"));
        fs::write(manager.path(), b"{\"schema_version\": 1, \"positions\": [").unwrap();

        let outcome = manager.load_detailed();
        assert!(matches!(outcome, LoadOutcome::Invalid(_)));
        assert!(!manager.path().exists());
        assert!(manager.quarantine_path().exists());
        assert!(manager.load().is_none());
    }

    #[test]
    fn test_invalid_levels_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path().join("state.json"));
        let mut state = sample_state();
        state.positions[0].sl_price = -1.0;
        fs::write(manager.path(), serde_json::to_vec(&state).unwrap()).unwrap();

        match manager.load_detailed() {
            LoadOutcome::Invalid(reason) => assert!(reason.contains("sl_price")),
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_active_symbol_fails_validation() {
        let mut state = sample_state();
        let mut dup = state.positions[0].clone();
        dup.id = uuid::Uuid::new_v4();
        state.positions.push(dup);

        assert!(state.validate().unwrap_err().contains("duplicate"));
    }

    #[test]
    fn test_future_schema_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path().join("state.json"));
        let mut value = serde_json::to_value(sample_state()).unwrap();
        value["schema_version"] = json!(CURRENT_SCHEMA_VERSION + 1);
        fs::write(manager.path(), serde_json::to_vec(&value).unwrap()).unwrap();

        assert!(matches!(manager.load_detailed(), LoadOutcome::Invalid(_)));
    }

    #[test]
    fn test_legacy_layout_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path().join("state.json"));
        let legacy = json!({
            "positions": {
                "btcusdt": {
                    "symbol": "btcusdt",
                    "qty": 0.5,
                    "entry_price": 100.0,
                    "tp": 104.0,
                    "sl": 97.0,
                    "opened_at": 1_700_000_000.0,
                    "stats": {"max_price": 103.0, "closing": false}
                },
                "ETHUSDT": {
                    "qty": 1.0,
                    "entry_price": 50.0,
                    "tp": null,
                    "sl": null,
                    "stats": {"closing": true}
                }
            },
            "meta": {"updated_at": 1_700_000_100.0}
        });
        fs::write(manager.path(), serde_json::to_vec(&legacy).unwrap()).unwrap();

        let (state, from_version) = match manager.load_detailed() {
            LoadOutcome::Migrated {
                state,
                from_version,
            } => (state, from_version),
            other => panic!("expected Migrated, got {:?}", other),
        };

        assert_eq!(from_version, 0);
        assert_eq!(state.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(state.positions.len(), 2);

        let btc = state.positions.iter().find(|p| p.symbol == "BTCUSDT").unwrap();
        assert_eq!(btc.quantity, 0.5);
        assert_eq!(btc.tp_price, 104.0);
        assert_eq!(btc.sl_price, 97.0);
        assert_eq!(btc.max_price_seen, 103.0);
        assert_eq!(btc.state, PositionState::Open);
        assert_eq!(btc.opened_at.timestamp(), 1_700_000_000);

        let eth = state.positions.iter().find(|p| p.symbol == "ETHUSDT").unwrap();
        assert_eq!(eth.state, PositionState::Closing);
        assert_eq!(eth.max_price_seen, 50.0);
        assert!(eth.sl_price < eth.entry_price && eth.entry_price < eth.tp_price);
        assert_eq!(state.last_tick_ts.timestamp(), 1_700_000_100);
    }

    #[test]
    fn test_current_version_loads_without_migration() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path().join("state.json"));
        manager.save(&sample_state()).unwrap();

        assert!(matches!(manager.load_detailed(), LoadOutcome::Loaded(_)));
    }
}
