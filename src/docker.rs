//! Container runtime access.
//!
//! Collectors talk to the runtime through [`ContainerRuntime`] so they can be
//! exercised without a Docker daemon. [`DockerRuntime`] is the Docker Engine
//! implementation over the local unix socket.

use bollard::container::{ListContainersOptions, Stats, StatsOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Label Docker Compose puts on every container it manages
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
/// Project reported for containers that carry no compose label
pub const UNKNOWN_PROJECT: &str = "unknown";
/// Seconds before a runtime API request is abandoned
const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Upper bound for the startup connectivity check
pub const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("no stats returned for container {0}")]
    NoStats(String),
}

/// One container as returned by the listing endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

impl ContainerSummary {
    /// Compose project, or `unknown` for containers started outside compose
    pub fn project(&self) -> &str {
        self.labels
            .get(COMPOSE_PROJECT_LABEL)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_PROJECT)
    }
}

/// The subset of a stats reading used for CPU and memory metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerStats {
    pub cpu_total: u64,
    pub precpu_total: u64,
    pub system_cpu: Option<u64>,
    pub presystem_cpu: Option<u64>,
    pub online_cpus: Option<u64>,
    /// Length of the per-CPU usage list, when the runtime reports one
    pub percpu_count: Option<usize>,
    pub memory_usage: Option<u64>,
    pub memory_limit: Option<u64>,
}

impl ContainerStats {
    /// CPU usage over the runtime's sampling window, 100 meaning one full core.
    ///
    /// `host_cpus` is used when the runtime does not say how many CPUs are online.
    pub fn cpu_percent(&self, host_cpus: usize) -> f64 {
        let (Some(system), Some(presystem)) = (self.system_cpu, self.presystem_cpu) else {
            return 0.0;
        };
        let system_delta = system as f64 - presystem as f64;
        if system_delta <= 0.0 {
            return 0.0;
        }
        let cpu_delta = self.cpu_total as f64 - self.precpu_total as f64;

        let online = match self.online_cpus {
            Some(n) if n > 0 => n as f64,
            _ => match self.percpu_count {
                Some(n) if n > 0 => n as f64,
                _ => host_cpus.max(1) as f64,
            },
        };

        (cpu_delta / system_delta) * online * 100.0
    }
}

impl From<Stats> for ContainerStats {
    fn from(stats: Stats) -> Self {
        Self {
            cpu_total: stats.cpu_stats.cpu_usage.total_usage,
            precpu_total: stats.precpu_stats.cpu_usage.total_usage,
            system_cpu: stats.cpu_stats.system_cpu_usage,
            presystem_cpu: stats.precpu_stats.system_cpu_usage,
            online_cpus: stats.cpu_stats.online_cpus,
            percpu_count: stats.cpu_stats.cpu_usage.percpu_usage.as_ref().map(Vec::len),
            memory_usage: stats.memory_stats.usage,
            memory_limit: stats.memory_stats.limit,
        }
    }
}

/// Operations the container collectors need from a runtime.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Runtime version string
    async fn version(&self) -> Result<String, RuntimeError>;

    /// List containers; stopped ones are included when `all` is set.
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// One-shot stats reading for a container
    async fn stats(&self, id: &str) -> Result<ContainerStats, RuntimeError>;
}

/// Docker Engine API client
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Create a client for the daemon socket. No connection is made until the first request.
    pub fn connect(socket: &Path) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_socket(
            &socket.to_string_lossy(),
            REQUEST_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )?;
        Ok(Self { docker })
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn version(&self) -> Result<String, RuntimeError> {
        let version = self.docker.version().await?;
        Ok(version.version.unwrap_or_else(|| "unknown".to_string()))
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .map(|c| {
                let id = c.id.unwrap_or_default();
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.chars().take(12).collect());
                ContainerSummary {
                    running: c.state.as_deref() == Some("running"),
                    labels: c.labels.unwrap_or_default(),
                    id,
                    name,
                }
            })
            .collect())
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats, RuntimeError> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut stream = Box::pin(self.docker.stats(id, Some(options)));
        match stream.next().await {
            Some(stats) => Ok(stats?.into()),
            None => Err(RuntimeError::NoStats(id.to_string())),
        }
    }
}

/// Log whether the runtime is reachable within [`CONNECTIVITY_TIMEOUT`].
/// Collection proceeds either way.
pub async fn check_connectivity(runtime: &dyn ContainerRuntime) -> bool {
    let check = async {
        let version = runtime.version().await?;
        let containers = runtime.list_containers(false).await?;
        Ok::<_, RuntimeError>((version, containers.len()))
    };

    match tokio::time::timeout(CONNECTIVITY_TIMEOUT, check).await {
        Err(_) => {
            tracing::warn!(
                timeout = ?CONNECTIVITY_TIMEOUT,
                "Container runtime did not answer, will keep retrying"
            );
            false
        }
        Ok(Ok((version, count))) => {
            tracing::info!(
                version = %version,
                containers = count,
                "Connected to container runtime"
            );
            true
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Container runtime not reachable, will keep retrying");
            false
        }
    }
}
