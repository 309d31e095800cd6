pub(crate) mod metrics;
pub(crate) mod tracing;

use std::sync::Arc;

use anyhow::Result;
use prometheus::{Encoder, Registry, TextEncoder};

pub use self::metrics::Metrics;

/// Owns the metric registry and makes sure tracing is initialised.
#[derive(Debug, Clone)]
pub struct Telemetry {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl Telemetry {
    /// Initialises tracing (once per process) and registers the worker metrics.
    ///
    /// # Errors
    /// Returns an error when the subscriber cannot be installed or a metric fails to register.
    pub fn new(sampling_ratio: f64) -> Result<Self> {
        tracing::init(sampling_ratio)?;
        Self::without_tracing()
    }

    /// Metrics only; used by tests that must not install a global subscriber.
    ///
    /// # Errors
    /// Returns an error when a metric fails to register.
    pub fn without_tracing() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(Metrics::new(&registry)?);
        Ok(Self { registry, metrics })
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn shared_metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn record_ready_probe(&self) {
        ::tracing::debug!("service ready probe");
    }

    pub fn record_live_probe(&self) {
        ::tracing::debug!("service live probe");
    }

    /// Renders this telemetry's registry in the Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(error) = encoder.encode(&metric_families, &mut buffer) {
            ::tracing::warn!(%error, "failed to encode prometheus metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
