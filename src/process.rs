//! Per-process readings from /proc/[pid]/stat.

use crate::metrics::ProcFs;
use anyhow::{Context, Result};
use std::fs;

/// CPU time and resident memory of one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStat {
    pub pid: u32,
    /// Command name (comm)
    pub name: String,
    /// User plus system CPU time in clock ticks
    pub cpu_ticks: u64,
    /// Resident Set Size (physical memory) in bytes
    pub rss_bytes: u64,
}

/// List the numeric entries of the procfs root
pub fn list_pids(procfs: &ProcFs) -> Result<Vec<u32>> {
    let entries = fs::read_dir(procfs.root())
        .with_context(|| format!("Failed to list {}", procfs.root().display()))?;

    Ok(entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str().and_then(|s| s.parse().ok()))
        .collect())
}

/// Read one process; fails when the process exited in the meantime
pub fn read_process(procfs: &ProcFs, pid: u32, page_size: u64) -> Result<ProcessStat> {
    let stat = procfs.read(format!("{pid}/stat"))?;
    parse_stat(pid, &stat, page_size)
}

/// Parse a stat line - format: pid (comm) state fields...
pub fn parse_stat(pid: u32, stat: &str, page_size: u64) -> Result<ProcessStat> {
    // The comm field can contain spaces and parentheses, so find the last ')'
    let comm_start = stat.find('(').context("Invalid stat format")?;
    let comm_end = stat.rfind(')').context("Invalid stat format")?;
    if comm_end < comm_start {
        anyhow::bail!("Invalid stat format");
    }

    let name = stat[comm_start + 1..comm_end].to_string();
    let fields: Vec<&str> = stat
        .get(comm_end + 2..)
        .unwrap_or_default()
        .split_whitespace()
        .collect();

    // Fields are 0-indexed after state
    // utime = field 11 (14th overall), stime = field 12 (15th overall)
    // rss = field 21 (24th overall) - in pages
    let field = |idx: usize| -> Result<u64> {
        fields
            .get(idx)
            .context("Truncated stat line")?
            .parse()
            .with_context(|| format!("Malformed stat field {idx}"))
    };

    let utime = field(11)?;
    let stime = field(12)?;
    let rss_pages = field(21)?;

    Ok(ProcessStat {
        pid,
        name,
        cpu_ticks: utime.saturating_add(stime),
        rss_bytes: rss_pages.saturating_mul(page_size),
    })
}

/// Memory page size in bytes
pub fn page_size() -> u64 {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as u64,
        _ => 4096,
    }
}

/// Clock ticks per second used by /proc/[pid]/stat
pub fn clock_ticks_per_sec() -> u64 {
    match unsafe { libc::sysconf(libc::_SC_CLK_TCK) } {
        n if n > 0 => n as u64,
        _ => 100,
    }
}
