//! Heaviest host processes by CPU and by resident memory.

use super::{BlockingRead, CollectContext, CollectionError, Collector, CollectorId};
use crate::metrics::ProcFs;
use crate::process::{self, ProcessStat};
use crate::sample::{MetricDesc, Sample};
use std::collections::HashMap;
use std::time::Instant;

const COMPONENT: &str = "top_processes";

pub const TOP_CPU: MetricDesc =
    MetricDesc::gauge("top_process_cpu_usage_percent", "Top processes by CPU usage");
pub const TOP_MEMORY: MetricDesc =
    MetricDesc::gauge("top_process_memory_usage_bytes", "Top processes by memory usage");

/// Default number of processes reported per ranking
pub const DEFAULT_LIMIT: usize = 5;

/// Reports the top N processes by CPU and the top N by RSS.
///
/// CPU usage is measured between consecutive ticks, so the collector keeps
/// the previous per-process CPU times.
pub struct TopProcessCollector {
    id: CollectorId,
    procfs: ProcFs,
    limit: usize,
    page_size: u64,
    clock_ticks: u64,
    prev_ticks: HashMap<u32, u64>,
    prev_at: Option<Instant>,
    read: BlockingRead<Result<(Vec<ProcessStat>, Instant), CollectionError>>,
}

/// A process with its CPU usage over the last interval
#[derive(Debug, Clone, PartialEq)]
struct RankedProcess {
    stat: ProcessStat,
    cpu_percent: f64,
}

impl TopProcessCollector {
    pub fn new(procfs: ProcFs, limit: usize) -> Self {
        let mut collector = Self {
            id: CollectorId::from(COMPONENT),
            procfs,
            limit,
            page_size: process::page_size(),
            clock_ticks: process::clock_ticks_per_sec(),
            prev_ticks: HashMap::new(),
            prev_at: None,
            read: BlockingRead::new(COMPONENT),
        };

        // Baseline so the first tick reports real CPU usage
        match scan(&collector.procfs, collector.page_size) {
            Ok((processes, at)) => {
                collector.rank(processes, at);
            }
            Err(e) => tracing::warn!(error = %e, "Could not take initial process reading"),
        }
        collector
    }

    /// Compute CPU usage against the previous scan and remember this one
    fn rank(&mut self, processes: Vec<ProcessStat>, taken_at: Instant) -> Vec<RankedProcess> {
        let elapsed = self
            .prev_at
            .map(|prev| taken_at.saturating_duration_since(prev).as_secs_f64());

        let ranked: Vec<RankedProcess> = processes
            .into_iter()
            .map(|stat| {
                let cpu_percent = match (self.prev_ticks.get(&stat.pid), elapsed) {
                    (Some(&prev), Some(elapsed)) => {
                        cpu_percent(prev, stat.cpu_ticks, elapsed, self.clock_ticks)
                    }
                    _ => 0.0,
                };
                RankedProcess { stat, cpu_percent }
            })
            .collect();

        self.prev_ticks = ranked
            .iter()
            .map(|p| (p.stat.pid, p.stat.cpu_ticks))
            .collect();
        self.prev_at = Some(taken_at);
        ranked
    }
}

#[async_trait::async_trait]
impl Collector for TopProcessCollector {
    fn id(&self) -> &CollectorId {
        &self.id
    }

    async fn collect(&mut self, ctx: &CollectContext) -> Result<Vec<Sample>, CollectionError> {
        if ctx.is_cancelled() {
            return Err(CollectionError::Cancelled);
        }
        let procfs = self.procfs.clone();
        let page_size = self.page_size;
        let (processes, taken_at) = self.read.run(move || scan(&procfs, page_size)).await??;

        let ranked = self.rank(processes, taken_at);
        Ok(top_samples(ranked, self.limit))
    }
}

/// Read every process; ones that disappear while scanning are skipped
fn scan(procfs: &ProcFs, page_size: u64) -> Result<(Vec<ProcessStat>, Instant), CollectionError> {
    let pids = process::list_pids(procfs)
        .map_err(|e| CollectionError::enumeration_failed(COMPONENT, format!("{e:#}")))?;
    let taken_at = Instant::now();

    let processes = pids
        .into_iter()
        .filter_map(|pid| process::read_process(procfs, pid, page_size).ok())
        .collect();
    Ok((processes, taken_at))
}

fn cpu_percent(prev_ticks: u64, ticks: u64, elapsed_secs: f64, clock_ticks: u64) -> f64 {
    if elapsed_secs <= 0.0 || clock_ticks == 0 {
        return 0.0;
    }
    let cpu_seconds = ticks.saturating_sub(prev_ticks) as f64 / clock_ticks as f64;
    (cpu_seconds / elapsed_secs) * 100.0
}

fn top_samples(mut ranked: Vec<RankedProcess>, limit: usize) -> Vec<Sample> {
    let mut samples = Vec::with_capacity(limit * 2);

    ranked.sort_by(|a, b| b.cpu_percent.total_cmp(&a.cpu_percent));
    samples.extend(ranked.iter().take(limit).map(|p| {
        TOP_CPU
            .sample(p.cpu_percent)
            .with_label("pid", p.stat.pid.to_string())
            .with_label("name", &p.stat.name)
    }));

    ranked.sort_by(|a, b| b.stat.rss_bytes.cmp(&a.stat.rss_bytes));
    samples.extend(ranked.iter().take(limit).map(|p| {
        TOP_MEMORY
            .sample(p.stat.rss_bytes as f64)
            .with_label("pid", p.stat.pid.to_string())
            .with_label("name", &p.stat.name)
    }));

    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::tests::stat_line;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> CollectContext {
        CollectContext::new(
            tokio::time::Instant::now() + Duration::from_secs(4),
            CancellationToken::new(),
        )
    }

    fn write_process(root: &Path, pid: u32, name: &str, ticks: u64, rss_pages: u64) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stat"), stat_line(pid, name, ticks, rss_pages)).unwrap();
    }

    fn ranked(pid: u32, cpu: f64, rss: u64) -> RankedProcess {
        RankedProcess {
            stat: ProcessStat {
                pid,
                name: format!("proc{pid}"),
                cpu_ticks: 0,
                rss_bytes: rss,
            },
            cpu_percent: cpu,
        }
    }

    #[test]
    fn test_cpu_percent() {
        // 50 ticks at 100 Hz over 1s is half a core
        assert!((cpu_percent(100, 150, 1.0, 100) - 50.0).abs() < 1e-9);
        assert_eq!(cpu_percent(100, 150, 0.0, 100), 0.0);
        // Counter reset (pid reuse) never goes negative
        assert_eq!(cpu_percent(150, 100, 1.0, 100), 0.0);
    }

    #[test]
    fn test_top_samples_ranks_independently() {
        let samples = top_samples(
            vec![
                ranked(1, 1.0, 900),
                ranked(2, 80.0, 100),
                ranked(3, 40.0, 500),
                ranked(4, 0.0, 50),
            ],
            2,
        );

        let cpu: Vec<&str> = samples
            .iter()
            .filter(|s| s.name() == TOP_CPU.name)
            .filter_map(|s| s.label("pid"))
            .collect();
        let mem: Vec<&str> = samples
            .iter()
            .filter(|s| s.name() == TOP_MEMORY.name)
            .filter_map(|s| s.label("pid"))
            .collect();

        assert_eq!(cpu, vec!["2", "3"]);
        assert_eq!(mem, vec!["1", "3"]);
        assert_eq!(samples[0].label("name"), Some("proc2"));
    }

    #[tokio::test]
    async fn test_collect_reads_process_table() {
        let proc = tempfile::tempdir().unwrap();
        write_process(proc.path(), 10, "idle", 0, 1000);
        write_process(proc.path(), 20, "busy", 0, 10);
        fs::create_dir(proc.path().join("self")).unwrap();

        let mut collector = TopProcessCollector::new(ProcFs::new(proc.path()), 5);

        std::thread::sleep(Duration::from_millis(20));
        write_process(proc.path(), 20, "busy", 500, 10);
        // Exits between listing and reading
        fs::create_dir(proc.path().join("30")).unwrap();

        let samples = collector.collect(&ctx()).await.unwrap();
        assert_eq!(samples.len(), 4);

        let top_cpu = &samples[0];
        assert_eq!(top_cpu.name(), TOP_CPU.name);
        assert_eq!(top_cpu.label("name"), Some("busy"));
        assert!(top_cpu.value() > 0.0);

        let top_mem = samples
            .iter()
            .find(|s| s.name() == TOP_MEMORY.name)
            .unwrap();
        assert_eq!(top_mem.label("pid"), Some("10"));
        assert_eq!(top_mem.value(), (1000 * process::page_size()) as f64);
    }

    #[tokio::test]
    async fn test_unlistable_procfs_is_enumeration_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = TopProcessCollector::new(ProcFs::new(dir.path().join("missing")), 5);

        let err = collector.collect(&ctx()).await.unwrap_err();
        assert!(matches!(err, CollectionError::Enumeration { .. }));
    }
}
