//! Collector contract shared by every data source.
//!
//! A [`Collector`] samples one domain of external state (host `/proc`,
//! the container runtime, ...) and returns the complete set of samples for
//! that domain, or a [`CollectionError`]. Collectors never touch the
//! registry themselves; the scheduler owns publishing and failure
//! bookkeeping.

pub mod compose;
pub mod container;
pub mod host;
pub mod top_process;

pub use compose::ComposeStatusCollector;
pub use container::ContainerMetricsCollector;
pub use host::HostMetricsCollector;
pub use top_process::TopProcessCollector;

use crate::sample::Sample;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Identity of a collector, used as the registry key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CollectorId(String);

impl CollectorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CollectorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CollectorId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Errors that end a collection tick without publishing.
#[derive(Debug, Clone, Error)]
pub enum CollectionError {
    /// An external read failed.
    #[error("{component}: {reason}")]
    Read {
        component: &'static str,
        reason: String,
    },

    /// Listing the resources to sample failed, so nothing can be reported.
    #[error("{component}: enumeration failed: {reason}")]
    Enumeration {
        component: &'static str,
        reason: String,
    },

    /// The call overran its deadline.
    #[error("timed out after {after:?}")]
    Timeout { after: Duration },

    /// Shutdown was requested while collecting.
    #[error("cancelled")]
    Cancelled,

    /// The collector panicked.
    #[error("collector panicked: {0}")]
    Panicked(String),
}

impl CollectionError {
    pub fn read_failed(component: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Read {
            component,
            reason: reason.to_string(),
        }
    }

    pub fn enumeration_failed(component: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Enumeration {
            component,
            reason: reason.to_string(),
        }
    }
}

/// Outcome of one tick
#[derive(Debug, Clone)]
pub enum CollectorResult {
    Success(Vec<Sample>),
    Failure {
        reason: CollectionError,
        at: DateTime<Utc>,
    },
}

impl CollectorResult {
    pub fn failure(reason: CollectionError) -> Self {
        Self::Failure {
            reason,
            at: Utc::now(),
        }
    }

}

impl From<Result<Vec<Sample>, CollectionError>> for CollectorResult {
    fn from(result: Result<Vec<Sample>, CollectionError>) -> Self {
        match result {
            Ok(samples) => Self::Success(samples),
            Err(reason) => Self::failure(reason),
        }
    }
}

/// Execution context handed to every `collect` call.
#[derive(Debug, Clone)]
pub struct CollectContext {
    deadline: Instant,
    cancel: CancellationToken,
}

impl CollectContext {
    pub fn new(deadline: Instant, cancel: CancellationToken) -> Self {
        Self { deadline, cancel }
    }

    /// Instant by which the call must have returned
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when shutdown has been requested
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// A read running on the blocking thread pool.
///
/// The join handle is kept across `collect` calls, so a read that outlives
/// a timed-out call is not leaked: until it finishes, later calls fail fast
/// instead of piling up another blocked thread.
pub(crate) struct BlockingRead<T> {
    component: &'static str,
    pending: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> BlockingRead<T> {
    pub(crate) fn new(component: &'static str) -> Self {
        Self {
            component,
            pending: None,
        }
    }

    /// Run `read` on the blocking pool and wait for it.
    ///
    /// If a read from an earlier, abandoned call is still running, no new
    /// read is started. An earlier read that has finished since is discarded.
    pub(crate) async fn run<F>(&mut self, read: F) -> Result<T, CollectionError>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        if self.pending.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(CollectionError::read_failed(
                self.component,
                "previous read still in progress",
            ));
        }

        let handle = self.pending.insert(tokio::task::spawn_blocking(read));
        let joined = handle.await;
        self.pending = None;
        joined.map_err(|e| CollectionError::read_failed(self.component, e))
    }
}

/// A source of samples for one domain.
///
/// `collect` is only ever called by the task that owns the collector, one
/// call at a time, so implementations may keep private baselines (e.g. the
/// previous CPU counters) in `&mut self`.
///
/// Failure of a single sub-resource (one container, one mountpoint) is not
/// an error: the collector drops that resource and returns the rest. Only a
/// failure that leaves nothing to report, such as being unable to list the
/// resources at all, is returned as `Err`.
#[async_trait::async_trait]
pub trait Collector: Send + 'static {
    /// Stable identity, used as the registry key and in logs.
    fn id(&self) -> &CollectorId;

    /// Perform one collection.
    async fn collect(&mut self, ctx: &CollectContext) -> Result<Vec<Sample>, CollectionError>;
}
