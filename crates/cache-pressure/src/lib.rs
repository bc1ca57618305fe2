//! Process-wide memory pressure monitoring for cache-owning components.
//!
//! A [`MemoryMonitor`] samples memory usage on a fixed interval. When
//! `used / total` rises above the configured threshold, every registered
//! [`CacheParticipant`] is asked to release its cache.
//!
//! This crate is deliberately "best-effort":
//! - Clearing is cooperative; participants decide what to drop.
//! - The monitor holds participants weakly and never keeps them alive.
//! - Failures inside a sampling cycle are logged and never escape it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use cache_pressure::{CacheParticipant, MemoryMonitor, ReleaseError};
//!
//! struct Thumbnails;
//!
//! impl CacheParticipant for Thumbnails {
//!     fn release_cache(&self) -> Result<(), ReleaseError> {
//!         Ok(())
//!     }
//!
//!     fn request_detach(&self) {
//!         MemoryMonitor::global().deregister(self);
//!     }
//! }
//!
//! let thumbnails = Arc::new(Thumbnails);
//! MemoryMonitor::global().register(&thumbnails);
//! ```

pub mod cgroup;
mod config;
mod error;
mod logging;
mod monitor;
mod participant;
pub mod process;
mod report;
mod sampler;
mod source;

pub use config::{
    LoggingConfig, MonitorConfig, Settings, CONFIG_PATH_ENV_VAR, DEFAULT_SAMPLE_INTERVAL_MS,
    DEFAULT_THRESHOLD_RATIO, SAMPLE_INTERVAL_ENV_VAR, THRESHOLD_RATIO_ENV_VAR,
};
pub use error::{ConfigError, MonitorError, ReleaseError};
pub use logging::init_tracing;
pub use monitor::{MemoryMonitor, ParticipantRegistration};
pub use participant::{CacheParticipant, ParticipantId};
pub use report::{MonitorStats, SampleOutcome};
pub use source::{MemorySnapshot, MemorySource, SystemMemorySource};
