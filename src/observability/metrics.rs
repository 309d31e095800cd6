/// Prometheus metric definitions.
use prometheus::{
    Counter, CounterVec, Gauge, HistogramVec, Registry, register_counter_vec_with_registry,
    register_counter_with_registry, register_gauge_with_registry,
    register_histogram_vec_with_registry,
};

#[derive(Debug, Clone)]
pub struct Metrics {
    // counters
    pub messages_ingested: Counter,
    pub messages_rejected: CounterVec,
    pub rate_limit_waits: Counter,
    pub clusters_created: Counter,
    pub messages_resolved: Counter,
    pub sentiment_units: Counter,
    pub attribution_failures: Counter,
    pub stage_outcomes: CounterVec,

    // histograms
    pub stage_duration: HistogramVec,
    pub external_call_duration: HistogramVec,

    // gauges
    pub running_attempts: Gauge,
}

impl Metrics {
    /// Registers every worker metric with `registry`.
    ///
    /// # Errors
    /// Fails when a metric with the same name is already registered.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            messages_ingested: register_counter_with_registry!(
                "harmony_messages_ingested_total",
                "Messages accepted by the normaliser and persisted",
                registry
            )?,
            messages_rejected: register_counter_vec_with_registry!(
                "harmony_messages_rejected_total",
                "Messages dropped by the normaliser",
                &["reason"],
                registry
            )?,
            rate_limit_waits: register_counter_with_registry!(
                "harmony_rate_limit_waits_total",
                "Rate-limited message source requests that were slept on and retried",
                registry
            )?,
            clusters_created: register_counter_with_registry!(
                "harmony_clusters_created_total",
                "Message clusters persisted",
                registry
            )?,
            messages_resolved: register_counter_with_registry!(
                "harmony_messages_resolved_total",
                "Messages with coreference-resolved content persisted",
                registry
            )?,
            sentiment_units: register_counter_with_registry!(
                "harmony_sentiment_units_total",
                "Content units submitted to the sentiment service",
                registry
            )?,
            attribution_failures: register_counter_with_registry!(
                "harmony_attribution_failures_total",
                "Responses that could not be mapped back to their source messages",
                registry
            )?,
            stage_outcomes: register_counter_vec_with_registry!(
                "harmony_stage_outcomes_total",
                "Stage attempts by stage and outcome",
                &["stage", "outcome"],
                registry
            )?,
            stage_duration: register_histogram_vec_with_registry!(
                "harmony_stage_duration_seconds",
                "Wall time of a stage attempt",
                &["stage"],
                vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0],
                registry
            )?,
            external_call_duration: register_histogram_vec_with_registry!(
                "harmony_external_call_duration_seconds",
                "Latency of calls to external collaborators",
                &["service"],
                vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
                registry
            )?,
            running_attempts: register_gauge_with_registry!(
                "harmony_running_attempts",
                "Stage attempts currently executing in this process",
                registry
            )?,
        })
    }
}
