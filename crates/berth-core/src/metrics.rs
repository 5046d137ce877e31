//! Metrics sink for volume and container lifecycle counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Receives lifecycle events from the orchestration layer.
pub trait MetricsSink: Send + Sync {
    fn volume_created(&self);
    fn volume_failed(&self);
    fn container_created(&self);
    fn container_failed(&self);
}

/// Discards all events.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn volume_created(&self) {}
    fn volume_failed(&self) {}
    fn container_created(&self) {}
    fn container_failed(&self) {}
}

/// In-process counters.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    volumes_created: AtomicU64,
    volumes_failed: AtomicU64,
    containers_created: AtomicU64,
    containers_failed: AtomicU64,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn volumes_created(&self) -> u64 {
        self.volumes_created.load(Ordering::Relaxed)
    }

    pub fn volumes_failed(&self) -> u64 {
        self.volumes_failed.load(Ordering::Relaxed)
    }

    pub fn containers_created(&self) -> u64 {
        self.containers_created.load(Ordering::Relaxed)
    }

    pub fn containers_failed(&self) -> u64 {
        self.containers_failed.load(Ordering::Relaxed)
    }
}

impl MetricsSink for CountingMetrics {
    fn volume_created(&self) {
        self.volumes_created.fetch_add(1, Ordering::Relaxed);
    }

    fn volume_failed(&self) {
        self.volumes_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn container_created(&self) {
        self.containers_created.fetch_add(1, Ordering::Relaxed);
    }

    fn container_failed(&self) {
        self.containers_failed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_metrics() {
        let metrics = CountingMetrics::new();
        metrics.volume_created();
        metrics.volume_created();
        metrics.container_failed();

        assert_eq!(metrics.volumes_created(), 2);
        assert_eq!(metrics.volumes_failed(), 0);
        assert_eq!(metrics.containers_created(), 0);
        assert_eq!(metrics.containers_failed(), 1);
    }
}
