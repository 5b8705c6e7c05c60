//! Prometheus metrics for the reconciler process.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `tether_reconciles_total` | Counter | `controller`, `outcome` |
//! | `tether_reconcile_duration_seconds` | Histogram | `controller` |
//! | `tether_workqueue_depth` | Gauge | `controller` |
//!
//! All metrics use interior mutability and are safe to share across
//! worker tasks.

use std::sync::Arc;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Histogram buckets for reconcile duration (seconds).
pub const RECONCILE_BUCKETS: &[f64] = &[0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0];

/// Errors raised during metrics operations.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// A metric could not be registered.
    #[error("failed to register metric")]
    Registration(#[from] prometheus::Error),

    /// The registry could not be encoded for scraping.
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Per-controller reconcile metrics.
#[derive(Clone)]
pub struct EngineMetrics {
    reconciles_total: IntCounterVec,
    reconcile_duration: HistogramVec,
    workqueue_depth: IntGaugeVec,
}

impl EngineMetrics {
    /// Creates and registers the metric families.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Registration`] on duplicate registration.
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let reconciles_total = IntCounterVec::new(
            Opts::new("tether_reconciles_total", "Completed reconciles"),
            &["controller", "outcome"],
        )?;
        registry.register(Box::new(reconciles_total.clone()))?;

        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "tether_reconcile_duration_seconds",
                "Wall-clock duration of one reconcile",
            )
            .buckets(RECONCILE_BUCKETS.to_vec()),
            &["controller"],
        )?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        let workqueue_depth = IntGaugeVec::new(
            Opts::new("tether_workqueue_depth", "Keys waiting per controller"),
            &["controller"],
        )?;
        registry.register(Box::new(workqueue_depth.clone()))?;

        Ok(Self {
            reconciles_total,
            reconcile_duration,
            workqueue_depth,
        })
    }

    /// Records one finished reconcile.
    pub fn reconcile_finished(&self, controller: &str, outcome: &str, seconds: f64) {
        self.reconciles_total
            .with_label_values(&[controller, outcome])
            .inc();
        self.reconcile_duration
            .with_label_values(&[controller])
            .observe(seconds);
    }

    /// Updates the queue-depth gauge for a controller.
    pub fn set_queue_depth(&self, controller: &str, depth: usize) {
        self.workqueue_depth
            .with_label_values(&[controller])
            .set(i64::try_from(depth).unwrap_or(i64::MAX));
    }
}

/// Registry plus engine metrics, shareable across tasks.
pub struct MetricsRegistry {
    registry: Registry,
    engine: EngineMetrics,
}

impl MetricsRegistry {
    /// Creates a registry with the engine metric families installed.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] when registration fails.
    pub fn new() -> Result<Arc<Self>, MetricsError> {
        let registry = Registry::new();
        let engine = EngineMetrics::new(&registry)?;
        Ok(Arc::new(Self { registry, engine }))
    }

    /// The engine metrics handle.
    #[must_use]
    pub fn engine(&self) -> EngineMetrics {
        self.engine.clone()
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Encoding`] when serialization fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_encodes() {
        let registry = MetricsRegistry::new().unwrap();
        let engine = registry.engine();
        engine.reconcile_finished("Widget.example.org.p1", "success", 0.05);
        engine.set_queue_depth("Widget.example.org.p1", 3);

        let text = registry.encode_text().unwrap();
        assert!(text.contains("tether_reconciles_total"));
        assert!(text.contains("Widget.example.org.p1"));
        assert!(text.contains("tether_workqueue_depth"));
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = Registry::new();
        let _first = EngineMetrics::new(&registry).unwrap();
        assert!(matches!(
            EngineMetrics::new(&registry),
            Err(MetricsError::Registration(_))
        ));
    }
}
