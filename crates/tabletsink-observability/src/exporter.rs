use prometheus::{Encoder, TextEncoder, TEXT_FORMAT};

use crate::metrics::REGISTRY;

/// Render every registered metric family in the Prometheus text exposition format.
///
/// The embedding process decides how to serve it (HTTP endpoint, log dump, ...).
pub fn encode_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;

    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Content type of [`encode_text`] output.
pub fn content_type() -> &'static str {
    TEXT_FORMAT
}
