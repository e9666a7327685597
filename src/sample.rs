//! Metric samples produced by collectors.

use std::collections::BTreeMap;

/// Metric type as advertised in the exposition `# TYPE` line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Counter => write!(f, "counter"),
        }
    }
}

/// Static description of a metric family: name, help text and type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDesc {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricKind,
}

impl MetricDesc {
    pub const fn gauge(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            kind: MetricKind::Gauge,
        }
    }

    pub const fn counter(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            kind: MetricKind::Counter,
        }
    }

    /// Build a sample of this metric with no labels
    pub fn sample(&self, value: f64) -> Sample {
        Sample::new(self, value)
    }
}

/// Label set keyed by label name. Keys are unique and iterate in sorted order.
pub type Labels = BTreeMap<String, String>;

/// One labeled numeric observation.
///
/// Samples are immutable once built; two samples describe the same series
/// when their name and labels are equal.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    name: String,
    help: String,
    kind: MetricKind,
    labels: Labels,
    value: f64,
}

impl Sample {
    pub fn new(desc: &MetricDesc, value: f64) -> Self {
        Self {
            name: desc.name.to_string(),
            help: desc.help.to_string(),
            kind: desc.kind,
            labels: Labels::new(),
            value,
        }
    }

    /// Attach a label, replacing any earlier value for the same key
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Look up a single label value
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESC: MetricDesc = MetricDesc::gauge("system_disk_usage_bytes", "Disk usage in bytes");

    #[test]
    fn test_labels_are_unique_and_sorted() {
        let sample = DESC
            .sample(1.0)
            .with_label("mountpoint", "/data")
            .with_label("device", "sda1")
            .with_label("mountpoint", "/");

        let keys: Vec<&str> = sample.labels().keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["device", "mountpoint"]);
        assert_eq!(sample.label("mountpoint"), Some("/"));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(MetricKind::Gauge.to_string(), "gauge");
        assert_eq!(MetricKind::Counter.to_string(), "counter");
    }
}
