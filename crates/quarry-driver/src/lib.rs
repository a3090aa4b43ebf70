//! Driver-facing pieces of the Quarry engine: per-dialect error
//! normalization, connection-string redaction and a scripted mock adapter.

pub mod mock;
pub mod normalizer;
pub mod redact;

pub use mock::{MockConfig, MockDriverAdapter, MockFailure, MockResponse};
pub use normalizer::{ErrorNormalizer, NormalizerRegistry, PatternRule, PatternTable};
pub use redact::redact_connection_strings;
