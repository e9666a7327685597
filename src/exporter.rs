//! Prometheus text exposition of the registry, served over HTTP.
//!
//! Every scrape takes a [`Snapshot`] and encodes it into a fresh
//! `prometheus::Registry`. Nothing is cached between scrapes, and a scrape
//! never waits on a collector.

use crate::registry::{Registry, Snapshot};
use crate::sample::{MetricDesc, MetricKind, Sample};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, TextEncoder};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Content type of the text exposition format
pub const CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

const LAST_SUCCESS: MetricDesc = MetricDesc::gauge(
    "metrics_exporter_last_success_timestamp_seconds",
    "Unix time of the last successful collection",
);
const PUBLISHES: MetricDesc = MetricDesc::counter(
    "metrics_exporter_publishes_total",
    "Successful collections published",
);

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("encoding failed: {0}")]
    Encode(#[from] prometheus::Error),

    #[error("exposition is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("http server: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode a snapshot in the text exposition format.
///
/// Samples are grouped into families by name. A family that cannot be
/// encoded (invalid name, samples disagreeing on labels or type) is left out
/// with a warning; the rest of the scrape is unaffected.
pub fn render(snapshot: &Snapshot) -> Result<String, ExportError> {
    let registry = prometheus::Registry::new();
    let own = self_samples(snapshot);

    let mut families: BTreeMap<&str, Vec<&Sample>> = BTreeMap::new();
    for sample in snapshot.samples().chain(own.iter()) {
        families.entry(sample.name()).or_default().push(sample);
    }

    for (name, samples) in &families {
        if let Err(e) = register_family(&registry, name, samples) {
            tracing::warn!(family = %name, error = %e, "Skipping metric family");
        }
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

fn register_family(
    registry: &prometheus::Registry,
    name: &str,
    samples: &[&Sample],
) -> prometheus::Result<()> {
    let Some(first) = samples.first() else {
        return Ok(());
    };
    let label_names: Vec<&str> = first.labels().keys().map(String::as_str).collect();
    if let Some(odd) = samples
        .iter()
        .find(|s| s.kind() != first.kind() || !s.labels().keys().eq(first.labels().keys()))
    {
        return Err(prometheus::Error::Msg(format!(
            "inconsistent samples: {} {:?} vs {} {:?}",
            first.kind(),
            label_names,
            odd.kind(),
            odd.labels().keys().collect::<Vec<_>>()
        )));
    }

    let help = if first.help().is_empty() {
        name
    } else {
        first.help()
    };
    let opts = Opts::new(name, help);

    match first.kind() {
        MetricKind::Gauge => {
            let family = GaugeVec::new(opts, &label_names)?;
            for sample in samples {
                family
                    .with_label_values(&label_values(sample))
                    .set(sample.value());
            }
            registry.register(Box::new(family))
        }
        MetricKind::Counter => {
            let family = CounterVec::new(opts, &label_names)?;
            for sample in samples {
                if !sample.value().is_finite() || sample.value() < 0.0 {
                    tracing::debug!(family = %name, value = sample.value(), "Dropping invalid counter value");
                    continue;
                }
                let counter = family.with_label_values(&label_values(sample));
                counter.reset();
                counter.inc_by(sample.value());
            }
            registry.register(Box::new(family))
        }
    }
}

fn label_values(sample: &Sample) -> Vec<&str> {
    sample.labels().values().map(String::as_str).collect()
}

/// Freshness of every collector present in the snapshot
fn self_samples(snapshot: &Snapshot) -> Vec<Sample> {
    snapshot
        .iter()
        .flat_map(|(id, entry)| {
            let updated = entry.updated_at().timestamp_millis() as f64 / 1000.0;
            [
                LAST_SUCCESS.sample(updated).with_label("collector", id.as_str()),
                PUBLISHES
                    .sample(entry.generation() as f64)
                    .with_label("collector", id.as_str()),
            ]
        })
        .collect()
}

/// Router exposing `GET /metrics`
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

async fn metrics(State(registry): State<Arc<Registry>>) -> Response {
    let snapshot = registry.snapshot();
    match render(&snapshot) {
        Ok(body) => {
            tracing::debug!(
                collectors = snapshot.len(),
                bytes = body.len(),
                "Served scrape"
            );
            ([(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Serve scrapes until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
) -> Result<(), ExportError> {
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
