//! Service layer for the Quarry engine.
//! Wires an adapter, the normalizer registry and the interpreter into an
//! [`Engine`], and loads configuration and logging for hosts.

mod config;
mod engine;
pub mod metrics;
pub mod telemetry;

pub use config::{
    BatchConfig, Config, ConfigError, DatabaseConfig, LoggingConfig, TransactionsConfig,
    DEFAULT_CONFIG_PATH,
};
pub use engine::{BatchRequest, Engine, PlanRequest, ServiceError, TransactionRequest};
pub use telemetry::{init_logging, TraceHeaders};

pub use quarry_query::{BatchOutcome, CancellationToken, Output};
