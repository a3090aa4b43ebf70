//! Central metrics registry and metric definitions
//!
//! Metrics are registered lazily on first access using once_cell::Lazy.
//! The engine only records them; exposing the registry is left to the host.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};

// ===== Statement Metrics =====

/// Statements sent to a driver by provider, statement kind and outcome
pub static STATEMENTS_EXECUTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "quarry_statements_total",
        "Total number of statements sent to driver adapters",
        &["provider", "kind", "outcome"]
    )
    .expect("Failed to register statements counter")
});

/// Statement latency histogram
pub static STATEMENT_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "quarry_statement_duration_seconds",
        "Statement execution latency in seconds",
        &["provider", "kind"],
        // Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s, 30s
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to register statement latency histogram")
});

// ===== Transaction Metrics =====

/// Closed transactions by outcome (committed, rolled_back, timed_out, start_timeout)
pub static TRANSACTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "quarry_transactions_total",
        "Total number of transactions by final outcome",
        &["outcome"]
    )
    .expect("Failed to register transactions counter")
});

/// Currently open transactions
pub static ACTIVE_TRANSACTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "quarry_active_transactions",
        "Number of transactions currently open"
    )
    .expect("Failed to register active transactions gauge")
});

// ===== Governor Metrics =====

/// Responses rejected for exceeding the configured size ceiling
pub static RESPONSES_TOO_LARGE: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "quarry_responses_too_large_total",
        "Total number of responses rejected for exceeding max_response_size"
    )
    .expect("Failed to register response size counter")
});

/// Adapter calls abandoned after query_timeout
pub static QUERY_TIMEOUTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "quarry_query_timeouts_total",
        "Total number of adapter calls that exceeded query_timeout",
        &["provider"]
    )
    .expect("Failed to register query timeout counter")
});
