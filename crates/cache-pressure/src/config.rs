use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CONFIG_PATH_ENV_VAR: &str = "CACHE_PRESSURE_CONFIG_PATH";
pub const SAMPLE_INTERVAL_ENV_VAR: &str = "CACHE_PRESSURE_SAMPLE_INTERVAL_MS";
pub const THRESHOLD_RATIO_ENV_VAR: &str = "CACHE_PRESSURE_THRESHOLD_RATIO";

pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_THRESHOLD_RATIO: f64 = 0.8;

/// Sampling parameters. Fixed for the lifetime of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    /// Delay between sampling cycles, in milliseconds.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Caches are cleared when `used / total` is strictly greater than this.
    #[serde(default = "default_threshold_ratio")]
    pub threshold_ratio: f64,
}

fn default_sample_interval_ms() -> u64 {
    DEFAULT_SAMPLE_INTERVAL_MS
}

fn default_threshold_ratio() -> f64 {
    DEFAULT_THRESHOLD_RATIO
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: DEFAULT_SAMPLE_INTERVAL_MS,
            threshold_ratio: DEFAULT_THRESHOLD_RATIO,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_interval_ms == 0 {
            return Err(ConfigError::InvalidInterval(self.sample_interval_ms));
        }
        // Also rejects NaN.
        if !(self.threshold_ratio > 0.0 && self.threshold_ratio <= 1.0) {
            return Err(ConfigError::InvalidThreshold(self.threshold_ratio));
        }
        Ok(())
    }

    pub fn sample_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sample_interval_ms)
    }

    /// Configuration for the process-wide monitor.
    ///
    /// Starts from the file named by [`CONFIG_PATH_ENV_VAR`] (or defaults),
    /// then applies [`SAMPLE_INTERVAL_ENV_VAR`] and [`THRESHOLD_RATIO_ENV_VAR`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_PATH_ENV_VAR) {
            Some(path) => Settings::load(Path::new(&path))?.monitor,
            None => Self::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(SAMPLE_INTERVAL_ENV_VAR) {
            self.sample_interval_ms = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    var: SAMPLE_INTERVAL_ENV_VAR,
                    value: value.clone(),
                })?;
        }
        if let Some(value) = lookup(THRESHOLD_RATIO_ENV_VAR) {
            self.threshold_ratio = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    var: THRESHOLD_RATIO_ENV_VAR,
                    value: value.clone(),
                })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit newline-delimited JSON instead of human-readable lines.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Top-level configuration file.
///
/// ```toml
/// [monitor]
/// sample_interval_ms = 10000
/// threshold_ratio = 0.8
///
/// [logging]
/// level = "info"
/// json = false
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Settings {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let settings: Self =
            toml::from_str(text).map_err(|err| ConfigError::Toml(err.message().to_string()))?;
        settings.monitor.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}
