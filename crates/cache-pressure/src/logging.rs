use crate::config::LoggingConfig;
use std::sync::Once;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

static TRACING_INIT: Once = Once::new();

impl LoggingConfig {
    /// `RUST_LOG` when set and valid, otherwise the configured level.
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Installs a global `tracing` subscriber for the host process.
///
/// Safe to call more than once; only the first call has an effect, and an
/// already-installed subscriber from elsewhere is left in place.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .boxed()
        };

        let result = tracing_subscriber::registry()
            .with(layer.with_filter(config.env_filter()))
            .try_init();
        if result.is_err() {
            tracing::debug!(
                target: "cache_pressure.logging",
                "a global tracing subscriber is already installed"
            );
        }
    });
}
