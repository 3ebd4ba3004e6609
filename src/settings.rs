//! Typed settings loading for the host process.
//!
//! Settings are loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables (prefixed with `PVHOST_`, `__` between the
//!    section and the field name)
//!
//! The typed sections configure the ambient machinery (logging, reactor
//! poll/watchdog intervals, autosave cadence). The free-form `[channels]`
//! table is *not* typed: it is converted to a nested JSON mapping and seeded
//! into the [`ConfigTree`](crate::configtree::ConfigTree) as external
//! overrides before any component resolves a key.
//!
//! # Example
//! ```no_run
//! use pvhost::settings::Settings;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load_from("pvhost.toml")?;
//! println!("host: {}", settings.application.name);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, HostError};

/// Top-level host settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application-level settings.
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Reactor and watchdog settings.
    #[serde(default)]
    pub reactor: ReactorSettings,
    /// Autosave (periodic persist) settings.
    #[serde(default)]
    pub autosave: AutosaveSettings,
    /// Free-form per-channel overrides, fed to the config tree.
    #[serde(default)]
    pub channels: Option<toml::Value>,
}

/// Application-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Host name used in logs and snapshots.
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Reactor and watchdog settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactorSettings {
    /// Ceiling on how long the loop blocks waiting for work.
    #[serde(with = "humantime_serde", default = "default_max_poll")]
    pub max_poll: Duration,
    /// Canary sampling interval (also the heartbeat period).
    #[serde(with = "humantime_serde", default = "default_canary_interval")]
    pub canary_interval: Duration,
    /// Stall window before the canary raises the liveness alarm.
    #[serde(with = "humantime_serde", default = "default_canary_timeout")]
    pub canary_timeout: Duration,
}

/// Autosave (periodic persist) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutosaveSettings {
    /// Cadence of the periodic persist flush.
    #[serde(with = "humantime_serde", default = "default_autosave_period")]
    pub period: Duration,
    /// Fraction of the period below which an overloaded run skips a slot.
    #[serde(default = "default_skip_fraction")]
    pub skip_fraction: f64,
    /// Snapshot file written by the built-in JSON sink.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
}

fn default_name() -> String {
    "pvhost".into()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_max_poll() -> Duration {
    Duration::from_secs(1)
}

fn default_canary_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_canary_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_autosave_period() -> Duration {
    Duration::from_secs(60)
}

fn default_skip_fraction() -> f64 {
    0.25
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("pvhost-snapshot.json")
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ReactorSettings {
    fn default() -> Self {
        Self {
            max_poll: default_max_poll(),
            canary_interval: default_canary_interval(),
            canary_timeout: default_canary_timeout(),
        }
    }
}

impl Default for AutosaveSettings {
    fn default() -> Self {
        Self {
            period: default_autosave_period(),
            skip_fraction: default_skip_fraction(),
            snapshot_path: default_snapshot_path(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationSettings::default(),
            reactor: ReactorSettings::default(),
            autosave: AutosaveSettings::default(),
            channels: None,
        }
    }
}

impl Settings {
    /// Load from `pvhost.toml` and `PVHOST_`-prefixed environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from("pvhost.toml")
    }

    /// Load from a specific file path (environment still applies).
    ///
    /// Environment variables override the file, with `__` as the section
    /// separator so field names containing `_` stay addressable, e.g.
    /// `PVHOST_APPLICATION__LOG_LEVEL=debug`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PVHOST_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate settings after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(HostError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if !(0.0..1.0).contains(&self.autosave.skip_fraction) {
            return Err(HostError::Configuration(format!(
                "Invalid autosave skip_fraction {}. Must be in [0, 1)",
                self.autosave.skip_fraction
            )));
        }

        if self.autosave.period.is_zero() {
            return Err(HostError::Configuration(
                "autosave period must be non-zero".into(),
            ));
        }

        if self.reactor.max_poll.is_zero() {
            return Err(HostError::Configuration(
                "reactor max_poll must be non-zero".into(),
            ));
        }

        Ok(())
    }

    /// The `[channels]` table as a nested JSON mapping for
    /// [`ConfigTree::load_external`](crate::configtree::ConfigTree::load_external).
    pub fn channel_overrides(&self) -> AppResult<serde_json::Value> {
        match &self.channels {
            None => Ok(serde_json::Value::Object(serde_json::Map::new())),
            Some(table) => serde_json::to_value(table).map_err(|e| {
                HostError::Configuration(format!("channels table is not convertible: {e}"))
            }),
        }
    }
}
