//! Prometheus exposition for the engine's metrics.
//!
//! The metrics themselves live in `quarry_core::metrics`; hosts that expose
//! a scrape endpoint call [`export_prometheus`].

use prometheus::{Encoder, TextEncoder};

/// Export all registered metrics in Prometheus text format.
///
/// # Returns
///
/// A `String` containing all metrics in Prometheus text format
///
/// # Example
///
/// ```rust
/// use quarry_service::metrics;
///
/// let metrics_text = metrics::export_prometheus();
/// println!("{}", metrics_text);
/// ```
pub fn export_prometheus() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .unwrap_or_else(|e| {
            tracing::error!("Failed to encode metrics: {}", e);
        });

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Failed to convert metrics to UTF-8: {}", e);
        String::from("# Error encoding metrics\n")
    })
}
