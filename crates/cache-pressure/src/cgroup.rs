//! Best-effort discovery of the cgroup memory limit for the current process.

use std::path::Path;
#[cfg(target_os = "linux")]
use std::path::PathBuf;
use std::sync::OnceLock;

/// Values at or above this are how runtimes spell "no limit" in cgroup v1.
const UNLIMITED_BYTES: u64 = 1 << 60;

#[cfg(target_os = "linux")]
const CGROUP_V2_ROOT: &str = "/sys/fs/cgroup";
#[cfg(target_os = "linux")]
const CGROUP_V1_MEMORY_ROOT: &str = "/sys/fs/cgroup/memory";

/// Memory-relevant entries of `/proc/self/cgroup`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupMembership {
    /// Unified hierarchy path (`0::/path`).
    pub unified: Option<String>,
    /// Path under the v1 `memory` controller (`N:memory:/path`).
    pub memory_controller: Option<String>,
}

impl CgroupMembership {
    pub fn parse(contents: &str) -> Self {
        let mut membership = Self::default();

        for line in contents.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let mut fields = line.splitn(3, ':');
            let (Some(hierarchy), Some(controllers), Some(path)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let path = path.trim();
            if path.is_empty() {
                continue;
            }

            if hierarchy == "0" && controllers.is_empty() {
                membership.unified.get_or_insert_with(|| path.to_string());
            } else if controllers.split(',').any(|name| name.trim() == "memory") {
                membership
                    .memory_controller
                    .get_or_insert_with(|| path.to_string());
            }
        }

        membership
    }
}

/// Parses `memory.max` (v2) or `memory.limit_in_bytes` (v1).
///
/// Returns `None` when the value means "unlimited" or cannot be parsed.
pub fn parse_limit_bytes(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "max" {
        return None;
    }

    match raw.parse::<u64>() {
        Ok(value) if value >= UNLIMITED_BYTES => None,
        Ok(value) => Some(value),
        Err(err) => {
            static REPORTED: OnceLock<()> = OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target: "cache_pressure.source",
                    raw,
                    error = %err,
                    "unrecognized cgroup memory limit value"
                );
            }
            None
        }
    }
}

/// Tightest limit found walking from `cgroup_path` up to the hierarchy root.
///
/// A child cgroup may report `max` while an ancestor is constrained, so every
/// level is consulted.
pub fn effective_limit_bytes(root: &Path, cgroup_path: &str, file_name: &str) -> Option<u64> {
    let mut dir = root.join(cgroup_path.trim_start_matches('/'));
    let mut tightest: Option<u64> = None;

    loop {
        if let Some(limit) = std::fs::read_to_string(dir.join(file_name))
            .ok()
            .and_then(|raw| parse_limit_bytes(&raw))
        {
            tightest = Some(tightest.map_or(limit, |current| current.min(limit)));
        }

        if dir.as_path() == root || !dir.pop() || !dir.starts_with(root) {
            break;
        }
    }

    tightest
}

/// Memory limit imposed on this process by its cgroup, if any.
#[cfg(target_os = "linux")]
pub fn memory_limit_bytes() -> Option<u64> {
    let contents = match std::fs::read_to_string("/proc/self/cgroup") {
        Ok(contents) => contents,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(
                    target: "cache_pressure.source",
                    error = %err,
                    "failed to read /proc/self/cgroup"
                );
            }
            return None;
        }
    };
    let membership = CgroupMembership::parse(&contents);

    let unified = membership.unified.as_deref().and_then(|path| {
        effective_limit_bytes(&PathBuf::from(CGROUP_V2_ROOT), path, "memory.max")
    });
    unified.or_else(|| {
        membership.memory_controller.as_deref().and_then(|path| {
            effective_limit_bytes(
                &PathBuf::from(CGROUP_V1_MEMORY_ROOT),
                path,
                "memory.limit_in_bytes",
            )
        })
    })
}

#[cfg(not(target_os = "linux"))]
pub fn memory_limit_bytes() -> Option<u64> {
    None
}
