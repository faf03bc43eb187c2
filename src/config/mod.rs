//! TPSL settings: defaults, TOML file, `TPSL__*` environment overrides.
//!
//! The loop re-reads settings every tick through [`SettingsSource`], so a
//! file edit takes effect at the next tick boundary.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::models::TrailingMode;
use crate::TpslError;

const ENV_PREFIX: &str = "TPSL";
const ENV_SEPARATOR: &str = "__";

/// Upper bound for `interval_sec` (one day)
pub const MAX_INTERVAL_SECS: u64 = 86_400;
/// Upper bound for `vol_window_sec` (seven days)
pub const MAX_VOL_WINDOW_SECS: u64 = 7 * 86_400;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub mode: TrailingMode,
    /// `false` pauses the loop until re-enabled
    pub enabled: bool,
    pub interval_sec: u64,

    /// Initial stop below entry (fraction)
    pub stop_loss_pct: f64,
    /// Initial target above entry (fraction)
    pub take_profit_pct: f64,

    /// Gain over entry that switches trailing on
    pub trailing_start_pct: f64,
    /// Trailing distance in STATIC mode
    pub trailing_distance_pct: f64,
    pub trailing_distance_pct_low_vol: f64,
    pub trailing_distance_pct_high_vol: f64,

    pub break_even_enabled: bool,
    pub break_even_trigger_pct: f64,

    pub vol_window_sec: u64,
    /// Relative range (max-min)/mid at or above which the bucket is HIGH
    pub vol_high_threshold_pct: f64,

    /// Optional time stop
    pub max_hold_secs: Option<u64>,

    pub price_timeout_ms: u64,
    pub max_consecutive_misses: u32,
    pub price_cache_capacity: usize,
    pub archive_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: TrailingMode::Dynamic,
            enabled: true,
            interval_sec: 5,
            stop_loss_pct: 0.01,
            take_profit_pct: 0.02,
            trailing_start_pct: 0.015,
            trailing_distance_pct: 0.005,
            trailing_distance_pct_low_vol: 0.0035,
            trailing_distance_pct_high_vol: 0.01,
            break_even_enabled: true,
            break_even_trigger_pct: 0.01,
            vol_window_sec: 300,
            vol_high_threshold_pct: 0.01,
            max_hold_secs: None,
            price_timeout_ms: 3_000,
            max_consecutive_misses: 3,
            price_cache_capacity: 500,
            archive_limit: 200,
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file plus process environment.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Same as [`Settings::load`], but environment overrides come from
    /// `env` when given instead of the process environment.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> crate::Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(env),
        );

        let settings: Settings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TpslError::Config(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.interval_sec == 0 || self.interval_sec > MAX_INTERVAL_SECS {
            return Err(TpslError::Config(format!(
                "interval_sec must be in 1..={}, got {}",
                MAX_INTERVAL_SECS, self.interval_sec
            )));
        }
        if self.vol_window_sec > MAX_VOL_WINDOW_SECS {
            return Err(TpslError::Config(format!(
                "vol_window_sec must be at most {}, got {}",
                MAX_VOL_WINDOW_SECS, self.vol_window_sec
            )));
        }
        if self.price_timeout_ms == 0 {
            return Err(TpslError::Config("price_timeout_ms must be > 0".into()));
        }
        if self.max_consecutive_misses == 0 {
            return Err(TpslError::Config(
                "max_consecutive_misses must be > 0".into(),
            ));
        }
        if self.price_cache_capacity == 0 {
            return Err(TpslError::Config(
                "price_cache_capacity must be > 0".into(),
            ));
        }

        let fractions = [
            ("stop_loss_pct", self.stop_loss_pct),
            ("take_profit_pct", self.take_profit_pct),
            ("trailing_start_pct", self.trailing_start_pct),
            ("trailing_distance_pct", self.trailing_distance_pct),
            (
                "trailing_distance_pct_low_vol",
                self.trailing_distance_pct_low_vol,
            ),
            (
                "trailing_distance_pct_high_vol",
                self.trailing_distance_pct_high_vol,
            ),
            ("break_even_trigger_pct", self.break_even_trigger_pct),
            ("vol_high_threshold_pct", self.vol_high_threshold_pct),
        ];
        for (name, value) in fractions {
            if !(value > 0.0 && value < 1.0) {
                return Err(TpslError::Config(format!(
                    "{} must be in (0, 1), got {}",
                    name, value
                )));
            }
        }

        Ok(())
    }
}

/// Source of settings, consulted once per tick
pub trait SettingsSource {
    fn load_settings(&self) -> Settings;
}

/// Fixed settings
impl SettingsSource for Settings {
    fn load_settings(&self) -> Settings {
        self.clone()
    }
}

/// Settings shared with another owner that may replace them at runtime
impl SettingsSource for Arc<RwLock<Settings>> {
    fn load_settings(&self) -> Settings {
        match self.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Settings file re-read on every call
///
/// A missing, unparsable or invalid file keeps the last good settings.
pub struct FileSettings {
    path: PathBuf,
    last_good: RwLock<Settings>,
}

impl FileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let initial = match Settings::load(Some(path.as_path())) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Using default TPSL settings");
                Settings::default()
            }
        };
        Self {
            path,
            last_good: RwLock::new(initial),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsSource for FileSettings {
    fn load_settings(&self) -> Settings {
        match Settings::load(Some(self.path.as_path())) {
            Ok(settings) => {
                if let Ok(mut last) = self.last_good.write() {
                    *last = settings.clone();
                }
                settings
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Settings reload failed, keeping last good settings"
                );
                match self.last_good.read() {
                    Ok(guard) => guard.clone(),
                    Err(poisoned) => poisoned.into_inner().clone(),
                }
            }
        }
    }
}
