//! Tablet Sink Observability
//!
//! Prometheus metrics for the tablet sink: row counters, per-route append and byte
//! counters, dispatch latency, stream gauges, partition creation and load outcomes.
//!
//! # Usage
//!
//! ```no_run
//! use tabletsink_observability::{exporter, metrics};
//!
//! // Register metric families once per process
//! metrics::init();
//!
//! // Render for a scrape endpoint
//! let body = exporter::encode_text().unwrap();
//! ```

pub mod exporter;
pub mod metrics;

// Re-export commonly used items
pub use metrics::{init as init_metrics, REGISTRY};

/// Initialize all observability components
pub fn init() {
    metrics::init();
}
