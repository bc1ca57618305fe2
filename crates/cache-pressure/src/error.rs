use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("sample interval must be a positive number of milliseconds (got {0})")]
    InvalidInterval(u64),
    #[error("threshold ratio must be in (0, 1] (got {0})")]
    InvalidThreshold(f64),
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn sampler thread: {0}")]
    SpawnSampler(#[source] std::io::Error),
    #[error("the global memory monitor is already initialized")]
    AlreadyInitialized,
}

/// Error reported by a participant whose `release_cache` could not complete.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ReleaseError {
    message: String,
}

impl ReleaseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
