//! Prometheus-backed metrics sink.

use berth_core::MetricsSink;
use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Volume and container lifecycle counters registered with a Prometheus
/// registry.
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    volumes_created: IntCounter,
    volumes_failed: IntCounter,
    containers_created: IntCounter,
    containers_failed: IntCounter,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> Result<IntCounter, MetricsError> {
            let counter = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        Ok(Self {
            volumes_created: counter("berth_volumes_created_total", "Volumes created")?,
            volumes_failed: counter("berth_volumes_failed_total", "Volumes that failed to create")?,
            containers_created: counter("berth_containers_created_total", "Containers created")?,
            containers_failed: counter(
                "berth_containers_failed_total",
                "Containers that failed to create",
            )?,
            registry,
        })
    }

    /// Encode all metrics in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl MetricsSink for PrometheusMetrics {
    fn volume_created(&self) {
        self.volumes_created.inc();
    }

    fn volume_failed(&self) {
        self.volumes_failed.inc();
    }

    fn container_created(&self) {
        self.containers_created.inc();
    }

    fn container_failed(&self) {
        self.containers_failed.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_exported() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.volume_created();
        metrics.volume_created();
        metrics.container_failed();

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("berth_volumes_created_total 2"));
        assert!(text.contains("berth_containers_failed_total 1"));
        assert!(text.contains("berth_volumes_failed_total 0"));
    }
}
