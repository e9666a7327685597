//! Metrics Exporter - host and Docker container metrics for Prometheus.
//!
//! Collectors sample one domain each (host `/proc`, top processes, running
//! containers, compose status) and run on independent cadences under the
//! [`scheduler::Scheduler`]. Every successful tick replaces that collector's
//! entry in the shared [`registry::Registry`]; the HTTP exporter renders a
//! snapshot of the registry on each scrape and never waits on collection.
//!
//! # Architecture
//!
//! - **Collectors** ([`collector`]): the `Collector` trait and its four implementations
//! - **Sources** ([`metrics`], [`process`], [`docker`]): procfs readers and the container runtime client
//! - **Scheduling** ([`scheduler`]): one task per collector, timeouts, failure bookkeeping
//! - **Exposition** ([`exporter`]): Prometheus text format over `GET /metrics`

pub mod collector;
pub mod config;
pub mod docker;
pub mod exporter;
pub mod logging;
pub mod metrics;
pub mod process;
pub mod registry;
pub mod sample;
pub mod scheduler;

pub use collector::{CollectionError, Collector, CollectorId};
pub use registry::{Registry, Snapshot};
pub use sample::{MetricDesc, MetricKind, Sample};
pub use scheduler::{CollectorSpec, Scheduler};
