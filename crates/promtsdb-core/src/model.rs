//! Metric family records carried from the collector to the forwarder.

use std::collections::BTreeMap;
use std::fmt;

/// Prometheus metric type, as announced by a `# TYPE` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
    #[default]
    Untyped,
}

impl MetricType {
    /// Parses the type keyword used in the text exposition format.
    pub fn from_keyword(s: &str) -> Option<Self> {
        match s {
            "counter" => Some(MetricType::Counter),
            "gauge" => Some(MetricType::Gauge),
            "histogram" => Some(MetricType::Histogram),
            "summary" => Some(MetricType::Summary),
            "untyped" => Some(MetricType::Untyped),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Histogram => "histogram",
            MetricType::Summary => "summary",
            MetricType::Untyped => "untyped",
        }
    }

    /// Sample name suffixes that belong to a family of this type.
    pub(crate) fn sample_suffixes(&self) -> &'static [&'static str] {
        match self {
            MetricType::Histogram => &["_bucket", "_sum", "_count"],
            MetricType::Summary => &["_sum", "_count"],
            _ => &[],
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single sample line of a scrape.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Full sample name, including `_bucket`/`_sum`/`_count` suffixes.
    pub name: String,
    /// Label set, sorted by label name.
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    /// Explicit timestamp in milliseconds since the epoch, if the source sent one.
    pub timestamp_ms: Option<i64>,
}

impl Sample {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            value,
            timestamp_ms: None,
        }
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }
}

/// A named group of same-typed samples produced by one scrape.
///
/// A family is moved through the pipeline (collector, queue, forwarder) and never
/// shared between stages.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub help: String,
    pub metric_type: MetricType,
    pub samples: Vec<Sample>,
    /// Time of the scrape that produced this family, in milliseconds since the epoch.
    /// Used for samples that carry no timestamp of their own.
    pub scraped_at_ms: i64,
}

impl MetricFamily {
    pub fn new(name: impl Into<String>, metric_type: MetricType, scraped_at_ms: i64) -> Self {
        Self {
            name: name.into(),
            help: String::new(),
            metric_type,
            samples: Vec::new(),
            scraped_at_ms,
        }
    }

    /// Sets `name=value` on every sample, replacing an existing label of the same name.
    pub fn add_label(&mut self, name: &str, value: &str) {
        for sample in &mut self.samples {
            sample.labels.insert(name.to_string(), value.to_string());
        }
    }

    /// Returns true if a sample called `sample_name` belongs to this family.
    pub(crate) fn owns_sample(&self, sample_name: &str) -> bool {
        if sample_name == self.name {
            return true;
        }
        sample_name
            .strip_prefix(self.name.as_str())
            .is_some_and(|suffix| self.metric_type.sample_suffixes().contains(&suffix))
    }
}
