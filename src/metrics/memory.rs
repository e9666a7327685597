//! RAM and swap usage from /proc/meminfo.

use super::ProcFs;
use anyhow::Result;

/// Memory metrics, all sizes in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemoryMetrics {
    /// Total system RAM
    pub total: u64,
    /// Used memory (excluding buffers/cache)
    pub used: u64,
    /// Used memory percentage
    pub used_percent: f64,
    pub swap_total: u64,
    pub swap_used: u64,
    /// Swap used percentage
    pub swap_percent: f64,
}

/// Read current memory metrics
pub fn read_memory(procfs: &ProcFs) -> Result<MemoryMetrics> {
    let meminfo = procfs.read("meminfo")?;
    parse_meminfo(&meminfo)
}

pub fn parse_meminfo(meminfo: &str) -> Result<MemoryMetrics> {
    let mut total: Option<u64> = None;
    let mut free: u64 = 0;
    let mut buffers: u64 = 0;
    let mut cached: u64 = 0;
    let mut swap_total: u64 = 0;
    let mut swap_free: u64 = 0;

    for line in meminfo.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }

        let value = parts[1].parse::<u64>().unwrap_or(0).saturating_mul(1024); // Convert from KB to bytes

        match parts[0] {
            "MemTotal:" => total = Some(value),
            "MemFree:" => free = value,
            "Buffers:" => buffers = value,
            "Cached:" => cached = value,
            "SwapTotal:" => swap_total = value,
            "SwapFree:" => swap_free = value,
            _ => {}
        }
    }

    let Some(total) = total else {
        anyhow::bail!("MemTotal missing from meminfo");
    };

    let used = total.saturating_sub(free.saturating_add(buffers).saturating_add(cached));
    let swap_used = swap_total.saturating_sub(swap_free);

    Ok(MemoryMetrics {
        total,
        used,
        used_percent: percent(used, total),
        swap_total,
        swap_used,
        swap_percent: percent(swap_used, swap_total),
    })
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole > 0 {
        100.0 * part as f64 / whole as f64
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "\
MemTotal:        1000 kB
MemFree:          200 kB
MemAvailable:     500 kB
Buffers:          100 kB
Cached:           200 kB
SwapCached:         0 kB
SwapTotal:        400 kB
SwapFree:         300 kB
";

    #[test]
    fn test_parse_meminfo() {
        let mem = parse_meminfo(MEMINFO).unwrap();
        assert_eq!(mem.total, 1000 * 1024);
        assert_eq!(mem.used, 500 * 1024);
        assert!((mem.used_percent - 50.0).abs() < 1e-9);
        assert_eq!(mem.swap_total, 400 * 1024);
        assert_eq!(mem.swap_used, 100 * 1024);
        assert!((mem.swap_percent - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_oversized_values_saturate() {
        let mem = parse_meminfo(
            "MemTotal: 18446744073709551615 kB\nMemFree: 18446744073709551615 kB\nCached: 18446744073709551615 kB\n",
        )
        .unwrap();
        assert_eq!(mem.total, u64::MAX);
        assert_eq!(mem.used, 0);
    }

    #[test]
    fn test_no_swap() {
        let mem = parse_meminfo("MemTotal: 1000 kB\nMemFree: 1000 kB\n").unwrap();
        assert_eq!(mem.swap_total, 0);
        assert_eq!(mem.swap_percent, 0.0);
        assert_eq!(mem.used, 0);
    }

    #[test]
    fn test_missing_total_is_an_error() {
        assert!(parse_meminfo("MemFree: 10 kB\n").is_err());
    }
}
