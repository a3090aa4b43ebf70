//! Logging initialisation and per-request log context.

use tracing::{field, info_span, Span};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Error raised when a global subscriber is already installed.
pub type InitError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` wins over `config.level` when set.
pub fn init_logging(config: &LoggingConfig) -> Result<(), InitError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if config.format == "json" {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    }
}

/// W3C trace context forwarded by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TraceHeaders {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceparent: Option<String>,
}

impl TraceHeaders {
    pub fn new(traceparent: impl Into<String>) -> Self {
        Self {
            traceparent: Some(traceparent.into()),
        }
    }
}

/// Span every request runs in; log lines inside it carry the request id
/// and the caller's trace context.
pub fn request_span(operation: &'static str, request_id: &str, trace: &TraceHeaders) -> Span {
    let span = info_span!(
        "request",
        operation,
        request_id = %request_id,
        traceparent = field::Empty,
    );
    if let Some(traceparent) = &trace.traceparent {
        span.record("traceparent", traceparent.as_str());
    }
    span
}
