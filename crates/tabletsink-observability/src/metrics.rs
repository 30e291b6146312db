use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Row Metrics
    // ============================================================================

    /// Rows handed to the sink by the upstream pipeline
    pub static ref SINK_INPUT_ROWS_TOTAL: IntCounter = IntCounter::new(
        "tabletsink_input_rows_total",
        "Total rows received by the sink"
    ).expect("metric can be created");

    /// Rows routed to at least one tablet
    pub static ref SINK_OUTPUT_ROWS_TOTAL: IntCounter = IntCounter::new(
        "tabletsink_output_rows_total",
        "Total rows routed to tablets"
    ).expect("metric can be created");

    /// Rows dropped by validation (e.g. null partition key)
    pub static ref SINK_FILTERED_ROWS_TOTAL: IntCounter = IntCounter::new(
        "tabletsink_filtered_rows_total",
        "Total rows filtered during routing"
    ).expect("metric can be created");

    // ============================================================================
    // Replica Write Metrics
    // ============================================================================

    /// Row appends issued, by route (local writer or remote stream)
    pub static ref SINK_APPENDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tabletsink_appends_total", "Total tablet appends issued"),
        &["route"]
    ).expect("metric can be created");

    /// Estimated bytes sent, by route
    pub static ref SINK_BYTES_SENT_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tabletsink_bytes_sent_total", "Estimated bytes sent to replicas"),
        &["route"]
    ).expect("metric can be created");

    /// Time spent dispatching one batch to all replicas
    pub static ref SINK_SEND_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("tabletsink_send_latency_seconds", "Batch dispatch latency in seconds")
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["stage"] // distribute, dispatch
    ).expect("metric can be created");

    /// Replica failures, by operation and error kind
    pub static ref SINK_REPLICA_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tabletsink_replica_errors_total", "Total replica failures"),
        &["operation", "error_type"] // open/append/close, unavailable/timeout/rejected
    ).expect("metric can be created");

    // ============================================================================
    // Load Lifecycle Metrics
    // ============================================================================

    /// Open replica streams across all loads in this process
    pub static ref SINK_STREAMS_OPEN: IntGauge = IntGauge::new(
        "tabletsink_streams_open",
        "Number of open replica streams"
    ).expect("metric can be created");

    /// On-demand partition creation requests
    pub static ref SINK_PARTITION_CREATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tabletsink_partition_creations_total", "Partition creation requests"),
        &["outcome"] // granted, failed, discarded
    ).expect("metric can be created");

    /// Loads finished, by outcome
    pub static ref SINK_LOADS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tabletsink_loads_total", "Total finished loads"),
        &["outcome"] // committed, failed, cancelled
    ).expect("metric can be created");

    /// Open/close phase latency
    pub static ref SINK_PHASE_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("tabletsink_phase_latency_seconds", "Load phase latency in seconds")
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["phase"] // open, close, cancel, partition_creation
    ).expect("metric can be created");
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        // Row metrics
        REGISTRY
            .register(Box::new(SINK_INPUT_ROWS_TOTAL.clone()))
            .expect("input_rows_total can be registered");
        REGISTRY
            .register(Box::new(SINK_OUTPUT_ROWS_TOTAL.clone()))
            .expect("output_rows_total can be registered");
        REGISTRY
            .register(Box::new(SINK_FILTERED_ROWS_TOTAL.clone()))
            .expect("filtered_rows_total can be registered");

        // Replica write metrics
        REGISTRY
            .register(Box::new(SINK_APPENDS_TOTAL.clone()))
            .expect("appends_total can be registered");
        REGISTRY
            .register(Box::new(SINK_BYTES_SENT_TOTAL.clone()))
            .expect("bytes_sent_total can be registered");
        REGISTRY
            .register(Box::new(SINK_SEND_LATENCY.clone()))
            .expect("send_latency can be registered");
        REGISTRY
            .register(Box::new(SINK_REPLICA_ERRORS_TOTAL.clone()))
            .expect("replica_errors_total can be registered");

        // Load lifecycle metrics
        REGISTRY
            .register(Box::new(SINK_STREAMS_OPEN.clone()))
            .expect("streams_open can be registered");
        REGISTRY
            .register(Box::new(SINK_PARTITION_CREATIONS_TOTAL.clone()))
            .expect("partition_creations_total can be registered");
        REGISTRY
            .register(Box::new(SINK_LOADS_TOTAL.clone()))
            .expect("loads_total can be registered");
        REGISTRY
            .register(Box::new(SINK_PHASE_LATENCY.clone()))
            .expect("phase_latency can be registered");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        init();
        // If no panic, registration succeeded
    }

    #[test]
    fn test_append_metrics_by_route() {
        SINK_APPENDS_TOTAL.with_label_values(&["test-route"]).inc();
        SINK_BYTES_SENT_TOTAL
            .with_label_values(&["test-route"])
            .inc_by(2048);

        assert_eq!(SINK_APPENDS_TOTAL.with_label_values(&["test-route"]).get(), 1);
        assert_eq!(
            SINK_BYTES_SENT_TOTAL.with_label_values(&["test-route"]).get(),
            2048
        );
    }

    #[test]
    fn test_load_outcomes() {
        SINK_LOADS_TOTAL.with_label_values(&["test-outcome"]).inc_by(3);
        assert_eq!(SINK_LOADS_TOTAL.with_label_values(&["test-outcome"]).get(), 3);
    }
}
