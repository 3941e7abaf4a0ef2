use std::collections::HashMap;

use parking_lot::Mutex;
use prometheus::{HistogramOpts, HistogramVec, Registry};
use tracing::warn;

/// Latency between the original message and the commit log record, in ms
pub const COMMIT_LOG_MSG_LATENCY: &str = "commit_log_msg_latency";
/// Latency between producing and consuming a commit log record, in ms
pub const COMMIT_LOG_LATENCY: &str = "commit_log_latency";

/// Fire-and-forget sink for distribution observations
pub trait MetricsSink: Send + Sync {
    fn distribution(&self, name: &'static str, value: f64, tags: &[(&'static str, String)]);
}

/// Discards every observation
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn distribution(&self, _name: &'static str, _value: f64, _tags: &[(&'static str, String)]) {}
}

/// A recorded observation
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub name: &'static str,
    pub value: f64,
    pub tags: Vec<(&'static str, String)>,
}

/// Keeps observations in memory, for tests and diagnostics
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    observations: Mutex<Vec<Observation>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observations(&self) -> Vec<Observation> {
        self.observations.lock().clone()
    }

    pub fn named(&self, name: &str) -> Vec<Observation> {
        self.observations
            .lock()
            .iter()
            .filter(|observation| observation.name == name)
            .cloned()
            .collect()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn distribution(&self, name: &'static str, value: f64, tags: &[(&'static str, String)]) {
        self.observations.lock().push(Observation {
            name,
            value,
            tags: tags.to_vec(),
        });
    }
}

/// Prometheus histograms, created on first observation of each name.
///
/// Metric names are prefixed with `synchronized_consumer_` and suffixed with
/// `_ms`; tag keys become label names.
pub struct PrometheusMetrics {
    registry: Registry,
    histograms: Mutex<HashMap<&'static str, HistogramVec>>,
}

impl PrometheusMetrics {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            histograms: Mutex::new(HashMap::new()),
        }
    }

    /// Use the process-wide default registry
    pub fn with_default_registry() -> Self {
        Self::new(prometheus::default_registry().clone())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn histogram(
        &self,
        name: &'static str,
        labels: &[&'static str],
    ) -> Option<HistogramVec> {
        let mut histograms = self.histograms.lock();
        if let Some(histogram) = histograms.get(name) {
            return Some(histogram.clone());
        }

        let opts = HistogramOpts::new(
            format!("synchronized_consumer_{}_ms", name),
            format!("Distribution of {} in milliseconds", name),
        )
        .buckets(vec![
            1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0, 60000.0,
        ]);

        let histogram = match HistogramVec::new(opts, labels) {
            Ok(histogram) => histogram,
            Err(e) => {
                warn!(metric = name, error = %e, "Invalid histogram definition");
                return None;
            }
        };
        if let Err(e) = self.registry.register(Box::new(histogram.clone())) {
            warn!(metric = name, error = %e, "Failed to register histogram");
        }

        histograms.insert(name, histogram.clone());
        Some(histogram)
    }
}

impl MetricsSink for PrometheusMetrics {
    fn distribution(&self, name: &'static str, value: f64, tags: &[(&'static str, String)]) {
        let labels: Vec<&'static str> = tags.iter().map(|(key, _)| *key).collect();
        let values: Vec<&str> = tags.iter().map(|(_, value)| value.as_str()).collect();

        if let Some(histogram) = self.histogram(name, &labels) {
            match histogram.get_metric_with_label_values(&values) {
                Ok(metric) => metric.observe(value),
                Err(e) => warn!(metric = name, error = %e, "Dropped observation"),
            }
        }
    }
}
