use crate::{cgroup, process};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Point-in-time memory usage as reported by a [`MemorySource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// Memory attributed to this process.
    pub used_bytes: u64,
    /// Memory the process may use before the host starts to struggle.
    pub total_bytes: u64,
    /// Hard limit imposed on the process (e.g. by a cgroup), when known.
    pub limit_bytes: Option<u64>,
}

impl MemorySnapshot {
    pub fn new(used_bytes: u64, total_bytes: u64) -> Self {
        Self {
            used_bytes,
            total_bytes,
            limit_bytes: None,
        }
    }

    /// `used / total`, or `None` when no total is known.
    pub fn usage_ratio(&self) -> Option<f64> {
        if self.total_bytes == 0 {
            return None;
        }
        Some(self.used_bytes as f64 / self.total_bytes as f64)
    }
}

/// Host memory introspection facility.
///
/// `None` means the facility is unavailable on this host; the monitor then
/// skips the cycle.
pub trait MemorySource: Send + Sync {
    fn sample(&self) -> Option<MemorySnapshot>;
}

impl<F> MemorySource for F
where
    F: Fn() -> Option<MemorySnapshot> + Send + Sync,
{
    fn sample(&self) -> Option<MemorySnapshot> {
        self()
    }
}

/// Samples the current process against physical memory and any cgroup limit.
pub struct SystemMemorySource {
    system: Mutex<System>,
    pid: Option<sysinfo::Pid>,
}

impl SystemMemorySource {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                tracing::debug!(
                    target: "cache_pressure.source",
                    error = err,
                    "current pid unavailable; process memory will come from procfs only"
                );
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }

    fn used_bytes(&self, system: &mut System) -> Option<u64> {
        if let Some(rss) = process::current_rss_bytes() {
            return Some(rss);
        }
        let pid = self.pid?;
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|process| process.memory())
    }
}

impl Default for SystemMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SystemMemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemMemorySource")
            .field("pid", &self.pid)
            .finish()
    }
}

impl MemorySource for SystemMemorySource {
    fn sample(&self) -> Option<MemorySnapshot> {
        let mut system = self.system.lock();
        system.refresh_memory();
        let physical = system.total_memory();

        let used_bytes = self.used_bytes(&mut system)?;
        let limit_bytes = cgroup::memory_limit_bytes();
        let total_bytes = effective_total_bytes(physical, limit_bytes);
        if total_bytes == 0 {
            return None;
        }

        Some(MemorySnapshot {
            used_bytes,
            total_bytes,
            limit_bytes,
        })
    }
}

/// The smaller of physical memory and the cgroup limit; zero means unknown.
fn effective_total_bytes(physical: u64, limit: Option<u64>) -> u64 {
    match (physical, limit) {
        (0, Some(limit)) => limit,
        (physical, Some(limit)) => physical.min(limit),
        (physical, None) => physical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_of_snapshot() {
        assert_eq!(MemorySnapshot::new(900, 1_000).usage_ratio(), Some(0.9));
        assert_eq!(MemorySnapshot::new(900, 0).usage_ratio(), None);
    }

    #[test]
    fn cgroup_limit_caps_physical_memory() {
        assert_eq!(effective_total_bytes(8_000, Some(2_000)), 2_000);
        assert_eq!(effective_total_bytes(8_000, Some(16_000)), 8_000);
        assert_eq!(effective_total_bytes(8_000, None), 8_000);
        assert_eq!(effective_total_bytes(0, Some(2_000)), 2_000);
        assert_eq!(effective_total_bytes(0, None), 0);
    }

    #[test]
    fn closures_are_sources() {
        let source = || Some(MemorySnapshot::new(1, 2));
        assert_eq!(source.sample(), Some(MemorySnapshot::new(1, 2)));
    }

    #[test]
    fn system_source_reports_sane_values_when_available() {
        let source = SystemMemorySource::new();
        if let Some(snapshot) = source.sample() {
            assert!(snapshot.total_bytes > 0);
            assert!(snapshot.used_bytes > 0);
        }
    }
}
