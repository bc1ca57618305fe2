use crate::source::MemorySnapshot;
use serde::{Deserialize, Serialize};

/// Result of a single sampling cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SampleOutcome {
    /// The memory source returned no data; nothing was checked.
    Unavailable,
    /// Usage was at or below the threshold.
    BelowThreshold {
        snapshot: MemorySnapshot,
        ratio: f64,
    },
    /// Usage exceeded the threshold and participants were asked to release.
    Broadcast {
        snapshot: MemorySnapshot,
        ratio: f64,
        /// Participants whose `release_cache` was invoked.
        notified: usize,
        /// Of those, how many returned an error or panicked.
        failed: usize,
    },
}

impl SampleOutcome {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, SampleOutcome::Broadcast { .. })
    }
}

/// Counters accumulated over the lifetime of a monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStats {
    pub cycles: u64,
    pub unavailable_samples: u64,
    pub broadcasts: u64,
    pub release_calls: u64,
    pub release_failures: u64,
}
