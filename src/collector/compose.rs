//! Up/down status of Docker Compose containers.

use super::{CollectContext, CollectionError, Collector, CollectorId};
use crate::docker::ContainerRuntime;
use crate::sample::{MetricDesc, Sample};
use std::sync::Arc;

const COMPONENT: &str = "compose_status";

pub const COMPOSE_STATUS: MetricDesc = MetricDesc::gauge(
    "docker_compose_container_status",
    "Docker Compose container status: 1=running, 0=stopped",
);
pub const COMPOSE_STATUS_FLAT: MetricDesc = MetricDesc::gauge(
    "docker_compose_container_status_flat",
    "Container status for Grafana status panel (1=running, 0=stopped)",
);

/// Reports every container, running or not, as 1 or 0.
pub struct ComposeStatusCollector {
    id: CollectorId,
    runtime: Arc<dyn ContainerRuntime>,
    project: Option<String>,
}

impl ComposeStatusCollector {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            id: CollectorId::from(COMPONENT),
            runtime,
            project: None,
        }
    }

    /// Only report containers of one compose project
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }
}

#[async_trait::async_trait]
impl Collector for ComposeStatusCollector {
    fn id(&self) -> &CollectorId {
        &self.id
    }

    async fn collect(&mut self, _ctx: &CollectContext) -> Result<Vec<Sample>, CollectionError> {
        let mut containers = self
            .runtime
            .list_containers(true)
            .await
            .map_err(|e| CollectionError::enumeration_failed(COMPONENT, e))?;
        containers.sort_by(|a, b| a.name.cmp(&b.name));

        let mut samples = Vec::with_capacity(containers.len() * 2);
        for container in containers {
            let project = container.project();
            if self.project.as_deref().is_some_and(|wanted| wanted != project) {
                continue;
            }

            let status = if container.running { 1.0 } else { 0.0 };
            samples.push(
                COMPOSE_STATUS
                    .sample(status)
                    .with_label("container_name", &container.name)
                    .with_label("project", project),
            );
            samples.push(
                COMPOSE_STATUS_FLAT
                    .sample(status)
                    .with_label("name", &container.name),
            );
        }
        Ok(samples)
    }
}
