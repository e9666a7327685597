//! Host CPU utilization from /proc/stat.

use super::ProcFs;
use anyhow::{Context, Result};

/// Raw CPU time values from the aggregate `cpu` line of /proc/stat
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        [
            self.user,
            self.nice,
            self.system,
            self.idle,
            self.iowait,
            self.irq,
            self.softirq,
            self.steal,
        ]
        .into_iter()
        .fold(0, u64::saturating_add)
    }
}

/// CPU sampler holding the previous reading for delta calculations
#[derive(Debug, Clone, Default)]
pub struct CpuSampler {
    prev: Option<CpuTimes>,
}

impl CpuSampler {
    pub fn new() -> Self {
        Self { prev: None }
    }

    /// Take a reading without producing a value, so the next `sample` has a baseline
    pub fn prime(&mut self, procfs: &ProcFs) -> Result<()> {
        self.prev = Some(read_cpu_times(procfs)?);
        Ok(())
    }

    /// Utilization percentage since the previous reading.
    ///
    /// Returns `None` on the first reading, when there is nothing to diff against.
    pub fn sample(&mut self, procfs: &ProcFs) -> Result<Option<f64>> {
        let curr = read_cpu_times(procfs)?;
        let utilization = self.prev.map(|prev| calculate_utilization(&prev, &curr));
        self.prev = Some(curr);
        Ok(utilization)
    }
}

fn read_cpu_times(procfs: &ProcFs) -> Result<CpuTimes> {
    let stat = procfs.read("stat")?;
    let line = stat
        .lines()
        .find(|line| line.starts_with("cpu "))
        .context("No aggregate cpu line in stat")?;
    parse_cpu_line(line)
}

fn parse_cpu_line(line: &str) -> Result<CpuTimes> {
    let parts: Vec<u64> = line
        .split_whitespace()
        .skip(1) // Skip "cpu"
        .map(|s| s.parse())
        .collect::<Result<_, _>>()
        .with_context(|| format!("Malformed cpu line: {line}"))?;

    if parts.len() < 4 {
        anyhow::bail!("Truncated cpu line: {line}");
    }

    Ok(CpuTimes {
        user: parts[0],
        nice: parts[1],
        system: parts[2],
        idle: parts[3],
        iowait: *parts.get(4).unwrap_or(&0),
        irq: *parts.get(5).unwrap_or(&0),
        softirq: *parts.get(6).unwrap_or(&0),
        steal: *parts.get(7).unwrap_or(&0),
    })
}

fn calculate_utilization(prev: &CpuTimes, curr: &CpuTimes) -> f64 {
    let total_delta = curr.total().saturating_sub(prev.total());
    if total_delta == 0 {
        return 0.0;
    }

    let idle_delta = curr.idle.saturating_sub(prev.idle);
    100.0 * (1.0 - (idle_delta as f64 / total_delta as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_stat(dir: &std::path::Path, user: u64, idle: u64) {
        let content = format!(
            "cpu  {user} 0 0 {idle} 0 0 0 0 0 0\ncpu0 {user} 0 0 {idle} 0 0 0 0 0 0\nctxt 100\n"
        );
        fs::write(dir.join("stat"), content).unwrap();
    }

    #[test]
    fn test_parse_cpu_line() {
        let times = parse_cpu_line("cpu  10 20 30 40 50 60 70 80 90 100").unwrap();
        assert_eq!(times.user, 10);
        assert_eq!(times.idle, 40);
        assert_eq!(times.steal, 80);
        assert_eq!(times.total(), 360);
    }

    #[test]
    fn test_total_saturates() {
        let times = CpuTimes {
            user: u64::MAX,
            idle: 5,
            ..CpuTimes::default()
        };
        assert_eq!(times.total(), u64::MAX);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_cpu_line("cpu  a b c d").is_err());
        assert!(parse_cpu_line("cpu  1 2").is_err());
    }

    #[test]
    fn test_first_sample_has_no_value() {
        let dir = tempfile::tempdir().unwrap();
        let procfs = ProcFs::new(dir.path());
        write_stat(dir.path(), 100, 900);

        let mut sampler = CpuSampler::new();
        assert_eq!(sampler.sample(&procfs).unwrap(), None);
    }

    #[test]
    fn test_utilization_from_delta() {
        let dir = tempfile::tempdir().unwrap();
        let procfs = ProcFs::new(dir.path());
        write_stat(dir.path(), 100, 900);

        let mut sampler = CpuSampler::new();
        sampler.prime(&procfs).unwrap();

        // 25 busy ticks out of 100
        write_stat(dir.path(), 125, 975);
        let value = sampler.sample(&procfs).unwrap().unwrap();
        assert!((value - 25.0).abs() < 1e-9);

        // No progress
        assert_eq!(sampler.sample(&procfs).unwrap(), Some(0.0));
    }

    #[test]
    fn test_missing_stat_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut sampler = CpuSampler::new();
        assert!(sampler.sample(&ProcFs::new(dir.path())).is_err());
    }
}
