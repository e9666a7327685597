//! Per-container CPU and memory usage from the container runtime.

use super::{CollectContext, CollectionError, Collector, CollectorId};
use crate::docker::{ContainerRuntime, ContainerStats, ContainerSummary, RuntimeError};
use crate::sample::{MetricDesc, Sample};
use futures::stream::{self, StreamExt};
use std::sync::Arc;

const COMPONENT: &str = "containers";
/// Stats requests in flight at once
const MAX_CONCURRENT_STATS: usize = 10;

pub const CONTAINER_CPU: MetricDesc =
    MetricDesc::gauge("container_cpu_usage_percent", "Container CPU usage percentage");
pub const CONTAINER_MEMORY: MetricDesc =
    MetricDesc::gauge("container_memory_usage_bytes", "Container memory usage in bytes");
pub const CONTAINER_MEMORY_LIMIT: MetricDesc =
    MetricDesc::gauge("container_memory_limit_bytes", "Container memory limit in bytes");

/// Collects resource usage of every running container.
///
/// A container whose stats cannot be read is left out of the tick; only a
/// failure to reach the runtime or list containers fails the whole tick.
pub struct ContainerMetricsCollector {
    id: CollectorId,
    runtime: Arc<dyn ContainerRuntime>,
    host_cpus: usize,
}

impl ContainerMetricsCollector {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        let host_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            id: CollectorId::from(COMPONENT),
            runtime,
            host_cpus,
        }
    }
}

#[async_trait::async_trait]
impl Collector for ContainerMetricsCollector {
    fn id(&self) -> &CollectorId {
        &self.id
    }

    async fn collect(&mut self, ctx: &CollectContext) -> Result<Vec<Sample>, CollectionError> {
        let unreachable = |e: RuntimeError| {
            CollectionError::enumeration_failed(COMPONENT, format!("runtime socket unreachable: {e}"))
        };
        self.runtime.ping().await.map_err(unreachable)?;
        let containers = self
            .runtime
            .list_containers(false)
            .await
            .map_err(|e| CollectionError::enumeration_failed(COMPONENT, e))?;

        let runtime = &self.runtime;
        let fetch = stream::iter(containers)
            .map(|container| async move {
                let stats = runtime.stats(&container.id).await;
                (container, stats)
            })
            .buffer_unordered(MAX_CONCURRENT_STATS)
            .collect::<Vec<(ContainerSummary, Result<ContainerStats, RuntimeError>)>>();

        // Stats calls are the slow part, don't hold up shutdown for them
        let mut readings = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(CollectionError::Cancelled),
            readings = fetch => readings,
        };
        readings.sort_by(|a, b| a.0.name.cmp(&b.0.name));

        let mut samples = Vec::with_capacity(readings.len() * 3);
        for (container, stats) in readings {
            match stats {
                Ok(stats) => samples.extend(container_samples(&container, &stats, self.host_cpus)),
                Err(e) => tracing::warn!(
                    container = %container.name,
                    error = %e,
                    "Error collecting metrics for container"
                ),
            }
        }
        Ok(samples)
    }
}

fn container_samples(
    container: &ContainerSummary,
    stats: &ContainerStats,
    host_cpus: usize,
) -> [Sample; 3] {
    let label = |sample: Sample| {
        sample
            .with_label("container_name", &container.name)
            .with_label("project", container.project())
    };
    [
        label(CONTAINER_CPU.sample(stats.cpu_percent(host_cpus))),
        label(CONTAINER_MEMORY.sample(stats.memory_usage.unwrap_or(0) as f64)),
        label(CONTAINER_MEMORY_LIMIT.sample(stats.memory_limit.unwrap_or(0) as f64)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::tests::{stats, FakeRuntime};
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> CollectContext {
        CollectContext::new(Instant::now() + Duration::from_secs(24), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_collects_running_containers() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.add("web", Some("shop"), true, Some(stats((0, 50), (0, 1000), Some(2))));
        runtime.add("db", None, true, Some(stats((0, 100), (0, 1000), Some(2))));
        runtime.add("old", Some("shop"), false, Some(stats((0, 1), (0, 1), Some(1))));

        let mut collector = ContainerMetricsCollector::new(runtime);
        let samples = collector.collect(&ctx()).await.unwrap();
        assert_eq!(samples.len(), 6);

        // Sorted by container name: db, web
        assert_eq!(samples[0].name(), "container_cpu_usage_percent");
        assert_eq!(samples[0].label("container_name"), Some("db-name"));
        assert_eq!(samples[0].label("project"), Some("unknown"));
        assert!((samples[0].value() - 20.0).abs() < 1e-9);

        let web_limit = samples
            .iter()
            .find(|s| {
                s.name() == "container_memory_limit_bytes"
                    && s.label("container_name") == Some("web-name")
            })
            .unwrap();
        assert_eq!(web_limit.label("project"), Some("shop"));
        assert_eq!(web_limit.value(), 1024.0);
    }

    #[tokio::test]
    async fn test_failed_container_is_omitted() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.add("web", Some("shop"), true, Some(stats((0, 50), (0, 1000), Some(2))));
        // No stats registered: the stats call fails
        runtime.add("flaky", Some("shop"), true, None);

        let mut collector = ContainerMetricsCollector::new(runtime);
        let samples = collector.collect(&ctx()).await.unwrap();
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.label("container_name") == Some("web-name")));
    }

    #[tokio::test]
    async fn test_unreachable_runtime_fails_tick() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.add("web", Some("shop"), true, Some(stats((0, 50), (0, 1000), Some(2))));
        runtime.set_down(true);

        let mut collector = ContainerMetricsCollector::new(runtime);
        let err = collector.collect(&ctx()).await.unwrap_err();
        assert!(matches!(err, CollectionError::Enumeration { .. }));
        assert!(err.to_string().contains("runtime socket unreachable"));
    }

    #[tokio::test]
    async fn test_shutdown_abandons_stats() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.add("web", Some("shop"), true, Some(stats((0, 50), (0, 1000), Some(2))));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut collector = ContainerMetricsCollector::new(runtime);
        let ctx = CollectContext::new(Instant::now() + Duration::from_secs(24), cancel);
        assert!(matches!(
            collector.collect(&ctx).await,
            Err(CollectionError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_no_containers_is_success() {
        let mut collector = ContainerMetricsCollector::new(Arc::new(FakeRuntime::default()));
        assert!(collector.collect(&ctx()).await.unwrap().is_empty());
    }
}
