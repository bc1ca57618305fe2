/// Extracts `VmRSS` (in bytes) from the contents of `/proc/<pid>/status`.
pub fn parse_vm_rss_bytes(status: &str) -> Option<u64> {
    let rest = status
        .lines()
        .find_map(|line| line.trim_start().strip_prefix("VmRSS:"))?;
    let kb = rest.split_whitespace().next()?;
    match kb.parse::<u64>() {
        Ok(kb) => Some(kb.saturating_mul(1024)),
        Err(err) => {
            // Sampled every cycle; only report the first malformed value.
            static REPORTED: std::sync::OnceLock<()> = std::sync::OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target: "cache_pressure.source",
                    value = kb,
                    error = %err,
                    "failed to parse VmRSS from /proc/self/status"
                );
            }
            None
        }
    }
}

/// Resident set size of the current process, read from procfs.
///
/// Returns `None` off Linux or when `/proc` is unavailable (some sandboxes).
pub fn current_rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read_to_string("/proc/self/status") {
            Ok(status) => parse_vm_rss_bytes(&status),
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(
                        target: "cache_pressure.source",
                        error = %err,
                        "failed to read /proc/self/status while sampling rss"
                    );
                }
                None
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
