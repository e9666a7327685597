//! Periodic collection scheduler.
//!
//! Every collector runs in its own Tokio task with its own ticker. Ticks are
//! laid out on a fixed grid starting at the moment the task starts, so a slow
//! collection skips the ticks it overran instead of pushing every later tick
//! back. A failing or stalled collector only affects its own task.

use crate::collector::{
    CollectContext, CollectionError, Collector, CollectorId, CollectorResult,
};
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Minimum allowed interval (1 second).
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);
/// Default time to wait for collector tasks at shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Share of the interval a single `collect` call may take.
const TIMEOUT_RATIO: f64 = 0.8;
/// Data older than this many intervals is reported as stale.
const STALE_AFTER_INTERVALS: u32 = 2;

/// A collector together with its cadence
pub struct CollectorSpec {
    collector: Box<dyn Collector>,
    interval: Duration,
    timeout: Duration,
}

impl CollectorSpec {
    /// Schedule `collector` every `interval`, with the default per-call timeout.
    pub fn new(collector: impl Collector, interval: Duration) -> Self {
        Self {
            collector: Box::new(collector),
            interval,
            timeout: default_timeout(interval),
        }
    }

    /// Override the per-call timeout; it is capped below the interval.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.min(default_timeout(self.interval));
        self
    }

    pub fn id(&self) -> &CollectorId {
        self.collector.id()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for CollectorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorSpec")
            .field("id", self.collector.id())
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn default_timeout(interval: Duration) -> Duration {
    interval.mul_f64(TIMEOUT_RATIO)
}

/// Summary of the latest tick
#[derive(Debug, Clone)]
pub enum LastResult {
    Success { samples: usize, at: DateTime<Utc> },
    Failure { reason: String, at: DateTime<Utc> },
}

/// Per-collector bookkeeping, owned by the collector's task.
#[derive(Debug, Clone)]
pub struct CollectorState {
    id: CollectorId,
    interval: Duration,
    timeout: Duration,
    ticks: u64,
    publishes: u64,
    consecutive_failures: u32,
    last_result: Option<LastResult>,
    last_success: Option<DateTime<Utc>>,
    stale_reported: bool,
}

impl CollectorState {
    fn new(spec: &CollectorSpec) -> Self {
        Self {
            id: spec.id().clone(),
            interval: spec.interval,
            timeout: spec.timeout,
            ticks: 0,
            publishes: 0,
            consecutive_failures: 0,
            last_result: None,
            last_success: None,
            stale_reported: false,
        }
    }

    pub fn id(&self) -> &CollectorId {
        &self.id
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Ticks started, successful or not
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Successful ticks, each of which published to the registry
    pub fn publishes(&self) -> u64 {
        self.publishes
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_result(&self) -> Option<&LastResult> {
        self.last_result.as_ref()
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success
    }

    /// True when the last success is older than the staleness window, or
    /// when there has never been one.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let window = self.interval * STALE_AFTER_INTERVALS;
        match self.last_success {
            Some(at) => now
                .signed_duration_since(at)
                .to_std()
                .map(|age| age > window)
                .unwrap_or(false),
            None => true,
        }
    }

    fn record(&mut self, result: CollectorResult, registry: &Registry, elapsed: Duration) {
        match result {
            CollectorResult::Success(samples) => {
                let count = samples.len();
                let generation = registry.publish(&self.id, samples);
                let now = Utc::now();

                if self.consecutive_failures > 0 {
                    tracing::info!(
                        collector = %self.id,
                        failures = self.consecutive_failures,
                        "Collector recovered"
                    );
                }
                tracing::debug!(
                    collector = %self.id,
                    samples = count,
                    generation,
                    duration_ms = elapsed.as_millis() as u64,
                    "Collection succeeded"
                );

                self.publishes += 1;
                self.consecutive_failures = 0;
                self.stale_reported = false;
                self.last_success = Some(now);
                self.last_result = Some(LastResult::Success {
                    samples: count,
                    at: now,
                });
            }
            CollectorResult::Failure { reason, at } => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                tracing::warn!(
                    collector = %self.id,
                    error = %reason,
                    consecutive_failures = self.consecutive_failures,
                    duration_ms = elapsed.as_millis() as u64,
                    "Collection failed, keeping previous samples"
                );

                if !self.stale_reported && self.last_success.is_some() && self.is_stale(at) {
                    tracing::warn!(
                        collector = %self.id,
                        last_success = ?self.last_success,
                        "Collector data is stale"
                    );
                    self.stale_reported = true;
                }

                self.last_result = Some(LastResult::Failure {
                    reason: reason.to_string(),
                    at,
                });
            }
        }
    }
}

/// Runs every registered collector on its own cadence until shutdown.
pub struct Scheduler {
    registry: Arc<Registry>,
    specs: Vec<CollectorSpec>,
    grace: Duration,
}

impl Scheduler {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            specs: Vec::new(),
            grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// How long `run` waits for collector tasks after shutdown before abandoning them.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Register a collector. Intervals below [`MIN_INTERVAL`] are clamped.
    pub fn add(&mut self, mut spec: CollectorSpec) -> &mut Self {
        if spec.interval < MIN_INTERVAL {
            tracing::warn!(
                collector = %spec.id(),
                min_interval = ?MIN_INTERVAL,
                "Interval is less than minimum allowed. Using minimum interval."
            );
            spec.interval = MIN_INTERVAL;
            spec.timeout = spec.timeout.min(default_timeout(MIN_INTERVAL));
        }
        tracing::info!(
            collector = %spec.id(),
            interval = ?spec.interval,
            timeout = ?spec.timeout,
            "Collector registered"
        );
        self.specs.push(spec);
        self
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Run all collectors until `shutdown` is cancelled.
    ///
    /// Returns once every collector task has stopped, or once the grace
    /// period has elapsed, whichever comes first. The returned states belong
    /// to the tasks that stopped in time.
    pub async fn run(self, shutdown: CancellationToken) -> Vec<CollectorState> {
        let Self {
            registry,
            specs,
            grace,
        } = self;

        let mut tasks = JoinSet::new();
        for spec in specs {
            tasks.spawn(run_collector(spec, Arc::clone(&registry), shutdown.clone()));
        }
        tracing::info!(collectors = tasks.len(), "Collector scheduler started");

        let mut states = Vec::with_capacity(tasks.len());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = tasks.join_next() => match joined {
                    Ok(state) => states.push(state),
                    Err(e) => tracing::error!(error = %e, "Collector task terminated abnormally"),
                },
            }
        }

        let deadline = Instant::now() + grace;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok(state))) => states.push(state),
                Ok(Some(Err(e))) => {
                    tracing::error!(error = %e, "Collector task terminated abnormally")
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        remaining = tasks.len(),
                        grace = ?grace,
                        "Collector scheduler shutdown timed out, abandoning tasks"
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        tracing::info!("Collector scheduler shutdown complete");
        states
    }
}

/// Tick loop of a single collector.
async fn run_collector(
    mut spec: CollectorSpec,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
) -> CollectorState {
    let mut state = CollectorState::new(&spec);
    let mut ticker = tokio::time::interval(spec.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(collector = %state.id, "Collector task started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        state.ticks += 1;
        let started = Instant::now();
        let ctx = CollectContext::new(started + spec.timeout, shutdown.clone());
        let result = collect_once(spec.collector.as_mut(), &ctx, spec.timeout).await;
        if let CollectorResult::Failure {
            reason: CollectionError::Cancelled,
            ..
        } = &result
        {
            tracing::debug!(collector = %state.id, "Collection cancelled by shutdown");
            break;
        }
        state.record(result, &registry, started.elapsed());
    }

    tracing::info!(
        collector = %state.id,
        ticks = state.ticks,
        publishes = state.publishes,
        "Collector task stopped"
    );
    state
}

/// Run one `collect` call bounded by `timeout`, turning timeouts and panics into failures.
async fn collect_once(
    collector: &mut dyn Collector,
    ctx: &CollectContext,
    timeout: Duration,
) -> CollectorResult {
    let call = AssertUnwindSafe(collector.collect(ctx)).catch_unwind();
    match tokio::time::timeout_at(ctx.deadline(), call).await {
        Ok(Ok(result)) => result.into(),
        Ok(Err(panic)) => CollectorResult::failure(CollectionError::Panicked(panic_message(&*panic))),
        Err(_) => CollectorResult::failure(CollectionError::Timeout { after: timeout }),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
