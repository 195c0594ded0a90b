/// Container-aware CPU limit detection for sizing the tokio worker pool.
///
/// Order: explicit `RESIN_CPU_LIMIT` env var, then cgroup v2
/// (`cpu.max`), then cgroup v1 (`cfs_quota_us`/`cfs_period_us`), then the
/// host CPU count. Without this, tokio sizes by host CPUs and
/// over-provisions threads inside CPU-limited containers.
pub fn worker_threads() -> usize {
    if let Ok(value) = std::env::var("RESIN_CPU_LIMIT") {
        if let Some(cores) = parse_cpu_value(&value) {
            let threads = cores.max(1);
            eprintln!("[runtime] CPU limit from RESIN_CPU_LIMIT: {} threads", threads);
            return threads;
        }
    }

    if let Ok(content) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        let mut parts = content.split_whitespace();
        if let (Some(quota), Some(period)) = (parts.next(), parts.next()) {
            if let Some(cores) = quota_cores(quota, period) {
                let threads = cores.max(1);
                eprintln!("[runtime] CPU limit from cgroup v2: {} threads", threads);
                return threads;
            }
        }
    }

    if let (Ok(quota), Ok(period)) = (
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        if let Some(cores) = quota_cores(quota.trim(), period.trim()) {
            let threads = cores.max(1);
            eprintln!("[runtime] CPU limit from cgroup v1: {} threads", threads);
            return threads;
        }
    }

    let threads = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    eprintln!("[runtime] using host CPU count: {} threads", threads);
    threads
}

/// "4" (cores) or "4000m" (millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_suffix('m') {
        Some(milli) => milli.parse::<usize>().ok().map(|m| m / 1000),
        None => value.parse::<usize>().ok(),
    }
}

/// Shared quota/period arithmetic for both cgroup versions. "max" or a
/// non-positive quota means unlimited.
fn quota_cores(quota: &str, period: &str) -> Option<usize> {
    if quota == "max" {
        return None;
    }
    let quota: i64 = quota.parse().ok()?;
    let period: i64 = period.parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period) as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_value() {
        assert_eq!(parse_cpu_value("4"), Some(4));
        assert_eq!(parse_cpu_value(" 8 "), Some(8));
        assert_eq!(parse_cpu_value("4000m"), Some(4));
        assert_eq!(parse_cpu_value("500m"), Some(0)); // caller clamps to 1
        assert_eq!(parse_cpu_value("abc"), None);
    }

    #[test]
    fn test_quota_cores() {
        assert_eq!(quota_cores("400000", "100000"), Some(4));
        assert_eq!(quota_cores("max", "100000"), None);
        assert_eq!(quota_cores("-1", "100000"), None);
        assert_eq!(quota_cores("0", "100000"), None);
    }
}
