//! Host CPU, RAM, swap and disk usage.

use super::{BlockingRead, CollectContext, CollectionError, Collector, CollectorId};
use crate::metrics::{cpu::CpuSampler, disk, memory, ProcFs};
use crate::sample::{MetricDesc, Sample};
use std::path::Path;

const COMPONENT: &str = "host";

pub const CPU_USAGE: MetricDesc =
    MetricDesc::gauge("system_cpu_usage_percent", "Average CPU usage across all cores");
pub const RAM_USAGE: MetricDesc = MetricDesc::gauge("system_ram_usage_bytes", "RAM usage in bytes");
pub const RAM_TOTAL: MetricDesc = MetricDesc::gauge("system_ram_total_bytes", "Total RAM in bytes");
pub const RAM_PERCENT: MetricDesc =
    MetricDesc::gauge("system_ram_usage_percent", "RAM usage percentage");
pub const SWAP_USAGE: MetricDesc =
    MetricDesc::gauge("system_swap_usage_bytes", "Swap usage in bytes");
pub const SWAP_TOTAL: MetricDesc =
    MetricDesc::gauge("system_swap_total_bytes", "Total swap in bytes");
pub const SWAP_PERCENT: MetricDesc =
    MetricDesc::gauge("system_swap_usage_percent", "Swap usage percentage");
pub const DISK_USAGE: MetricDesc =
    MetricDesc::gauge("system_disk_usage_bytes", "Disk usage in bytes");
pub const DISK_TOTAL: MetricDesc =
    MetricDesc::gauge("system_disk_total_bytes", "Total disk space in bytes");
pub const DISK_PERCENT: MetricDesc =
    MetricDesc::gauge("system_disk_usage_percent", "Disk usage percentage");

type HostReading = (Result<Vec<Sample>, CollectionError>, CpuSampler);

/// Collects host-wide resource usage from procfs.
pub struct HostMetricsCollector {
    id: CollectorId,
    procfs: ProcFs,
    cpu: CpuSampler,
    read: BlockingRead<HostReading>,
}

impl HostMetricsCollector {
    /// Create the collector and take the CPU baseline, so the first tick
    /// already reports utilization.
    pub fn new(procfs: ProcFs) -> Self {
        let mut cpu = CpuSampler::new();
        if let Err(e) = cpu.prime(&procfs) {
            tracing::warn!(error = %format!("{e:#}"), "Could not take initial CPU reading");
        }
        Self {
            id: CollectorId::from(COMPONENT),
            procfs,
            cpu,
            read: BlockingRead::new(COMPONENT),
        }
    }
}

#[async_trait::async_trait]
impl Collector for HostMetricsCollector {
    fn id(&self) -> &CollectorId {
        &self.id
    }

    async fn collect(&mut self, _ctx: &CollectContext) -> Result<Vec<Sample>, CollectionError> {
        // statvfs can hang on dead network mounts, keep it off the async workers
        let procfs = self.procfs.clone();
        let mut cpu = self.cpu.clone();
        let (result, cpu) = self
            .read
            .run(move || {
                let result = read_host(&procfs, &mut cpu);
                (result, cpu)
            })
            .await?;

        // Only a complete reading moves the CPU baseline
        if result.is_ok() {
            self.cpu = cpu;
        }
        result
    }
}

fn read_host(procfs: &ProcFs, cpu: &mut CpuSampler) -> Result<Vec<Sample>, CollectionError> {
    let unavailable = |e: anyhow::Error| {
        CollectionError::read_failed(COMPONENT, format!("proc filesystem unavailable: {e:#}"))
    };

    let cpu_usage = cpu.sample(procfs).map_err(unavailable)?;
    let mem = memory::read_memory(procfs).map_err(unavailable)?;

    let mut samples = Vec::with_capacity(16);
    if let Some(usage) = cpu_usage {
        samples.push(CPU_USAGE.sample(usage));
    }
    samples.extend([
        RAM_USAGE.sample(mem.used as f64),
        RAM_TOTAL.sample(mem.total as f64),
        RAM_PERCENT.sample(mem.used_percent),
        SWAP_USAGE.sample(mem.swap_used as f64),
        SWAP_TOTAL.sample(mem.swap_total as f64),
        SWAP_PERCENT.sample(mem.swap_percent),
    ]);

    // Disk metrics degrade to whatever can be read
    match disk::read_mounts(procfs) {
        Ok(mounts) => {
            for mount in mounts {
                match disk::filesystem_usage(Path::new(&mount.mountpoint)) {
                    Ok(usage) => samples.extend([
                        DISK_USAGE
                            .sample(usage.used as f64)
                            .with_label("mountpoint", &mount.mountpoint),
                        DISK_TOTAL
                            .sample(usage.total as f64)
                            .with_label("mountpoint", &mount.mountpoint),
                        DISK_PERCENT
                            .sample(usage.used_percent)
                            .with_label("mountpoint", &mount.mountpoint),
                    ]),
                    Err(e) => tracing::debug!(
                        mountpoint = %mount.mountpoint,
                        error = %format!("{e:#}"),
                        "Skipping mountpoint"
                    ),
                }
            }
        }
        Err(e) => tracing::warn!(
            error = %format!("{e:#}"),
            "Could not list mounts, omitting disk metrics"
        ),
    }

    Ok(samples)
}
