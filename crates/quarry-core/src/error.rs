use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of error kinds surfaced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    UniqueConstraintViolation,
    NullConstraintViolation,
    ForeignKeyConstraintViolation,
    TableDoesNotExist,
    ColumnNotFound,
    SocketTimeout,
    ConversionError,
    TransactionClosed,
    TransactionNotFound,
    TransactionWriteConflict,
    ResponseTooLarge,
    RecordNotFound,
    Cancelled,
    PlanError,
    Unknown,
}

impl ErrorKind {
    /// Stable string form, used for metric labels and log fields.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UniqueConstraintViolation => "UniqueConstraintViolation",
            Self::NullConstraintViolation => "NullConstraintViolation",
            Self::ForeignKeyConstraintViolation => "ForeignKeyConstraintViolation",
            Self::TableDoesNotExist => "TableDoesNotExist",
            Self::ColumnNotFound => "ColumnNotFound",
            Self::SocketTimeout => "SocketTimeout",
            Self::ConversionError => "ConversionError",
            Self::TransactionClosed => "TransactionClosed",
            Self::TransactionNotFound => "TransactionNotFound",
            Self::TransactionWriteConflict => "TransactionWriteConflict",
            Self::ResponseTooLarge => "ResponseTooLarge",
            Self::RecordNotFound => "RecordNotFound",
            Self::Cancelled => "Cancelled",
            Self::PlanError => "PlanError",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether a caller may retry the request that failed with this kind.
    ///
    /// The resource that produced a retryable error (connection, transaction)
    /// is already torn down; a retry always starts from a fresh request.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SocketTimeout | Self::TransactionWriteConflict | Self::TransactionClosed
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Offending constraint of a constraint-violation error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Constraint {
    /// Columns participating in the constraint.
    Fields(Vec<String>),
    /// Name of the index backing the constraint.
    Index(String),
    /// The driver only reported that a foreign key failed.
    ForeignKey {},
}

/// The only error shape that crosses the engine boundary.
///
/// Built once (by the error normalizer, the interpreter, or the transaction
/// manager) and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{kind}: {message}")]
pub struct CanonicalError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<Constraint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
}

impl CanonicalError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            original_code: None,
            original_message: None,
            constraint: None,
            table: None,
            column: None,
        }
    }

    /// Malformed plan, dangling reference or parameter mismatch. Never retried.
    #[must_use]
    pub fn plan(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PlanError, message)
    }

    #[must_use]
    pub fn conversion(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConversionError, message)
    }

    #[must_use]
    pub fn socket_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SocketTimeout, message)
    }

    #[must_use]
    pub fn transaction_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransactionClosed, message)
    }

    #[must_use]
    pub fn transaction_not_found(id: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::TransactionNotFound,
            format!("transaction `{id}` was not found"),
        )
    }

    #[must_use]
    pub fn response_too_large(limit: u64) -> Self {
        Self::new(
            ErrorKind::ResponseTooLarge,
            format!("response size exceeds the configured maximum of {limit} bytes"),
        )
    }

    #[must_use]
    pub fn query_timeout(timeout: Duration) -> Self {
        Self::socket_timeout(format!(
            "statement did not complete within {}ms",
            timeout.as_millis()
        ))
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation was cancelled by the caller")
    }

    /// Native error without a recognised pattern; code and message are kept verbatim.
    #[must_use]
    pub fn unknown(code: Option<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            original_code: code,
            original_message: Some(message.clone()),
            ..Self::new(ErrorKind::Unknown, message)
        }
    }

    #[must_use]
    pub fn with_original(mut self, code: Option<String>, message: impl Into<String>) -> Self {
        self.original_code = code;
        self.original_message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraint = Some(constraint);
        self
    }

    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    #[must_use]
    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }
}

/// Convenient result alias for engine operations.
pub type EngineResult<T> = Result<T, CanonicalError>;

/// Native error raised by a driver adapter, before normalization.
///
/// The variants carry what each driver family actually reports; the error
/// normalizer registered for the adapter's provider turns them into a
/// [`CanonicalError`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DriverError {
    /// SQLite family; `extended_code` is the extended result code.
    #[error("sqlite error {extended_code}: {message}")]
    Sqlite { extended_code: i32, message: String },

    /// Postgres family, as reported by the wire protocol error fields.
    #[error("postgres error {code}: {message}")]
    Postgres {
        code: String,
        message: String,
        severity: Option<String>,
        detail: Option<String>,
        column: Option<String>,
        table: Option<String>,
        constraint: Option<String>,
    },

    /// MySQL family.
    #[error("mysql error {code} ({state}): {message}")]
    Mysql {
        code: u16,
        state: String,
        message: String,
    },

    /// The adapter already knows the canonical shape (e.g. an unsupported
    /// isolation level or an exhausted pool).
    #[error("{0}")]
    Mapped(CanonicalError),

    /// Anything else: transport failures, driver bugs.
    #[error("{message}")]
    Other {
        code: Option<String>,
        message: String,
    },
}

impl DriverError {
    /// Creates an `Other` variant without a code.
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            code: None,
            message: message.into(),
        }
    }

    /// Native code as a string, when the driver reported one.
    #[must_use]
    pub fn code(&self) -> Option<String> {
        match self {
            Self::Sqlite { extended_code, .. } => Some(extended_code.to_string()),
            Self::Postgres { code, .. } => Some(code.clone()),
            Self::Mysql { code, .. } => Some(code.to_string()),
            Self::Mapped(err) => err.original_code.clone(),
            Self::Other { code, .. } => code.clone(),
        }
    }

    /// Native message as reported by the driver.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Sqlite { message, .. }
            | Self::Postgres { message, .. }
            | Self::Mysql { message, .. }
            | Self::Other { message, .. } => message,
            Self::Mapped(err) => &err.message,
        }
    }
}

/// Result alias for raw adapter calls.
pub type DriverResult<T> = Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_error_serializes_without_empty_fields() {
        let err = CanonicalError::new(ErrorKind::TableDoesNotExist, "table missing")
            .with_table("Widgets");

        let encoded = serde_json::to_value(&err).unwrap();
        assert_eq!(
            encoded,
            json!({
                "kind": "TableDoesNotExist",
                "message": "table missing",
                "table": "Widgets"
            })
        );
    }

    #[test]
    fn test_constraint_shapes_match_payload_contract() {
        let fields = serde_json::to_value(Constraint::Fields(vec!["email".into()])).unwrap();
        assert_eq!(fields, json!({ "fields": ["email"] }));

        let index = serde_json::to_value(Constraint::Index("users_email_key".into())).unwrap();
        assert_eq!(index, json!({ "index": "users_email_key" }));

        let fk = serde_json::to_value(Constraint::ForeignKey {}).unwrap();
        assert_eq!(fk, json!({ "foreignKey": {} }));
    }

    #[test]
    fn test_unknown_preserves_original_code_and_message() {
        let err = CanonicalError::unknown(Some("XX000".into()), "internal failure");
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert_eq!(err.original_code.as_deref(), Some("XX000"));
        assert_eq!(err.original_message.as_deref(), Some("internal failure"));
    }

    #[test]
    fn test_plan_errors_are_not_retryable() {
        assert!(!ErrorKind::PlanError.is_retryable());
        assert!(ErrorKind::SocketTimeout.is_retryable());
    }

    #[test]
    fn test_driver_error_exposes_native_code() {
        let err = DriverError::Sqlite {
            extended_code: 2067,
            message: "UNIQUE constraint failed: Users.email".into(),
        };
        assert_eq!(err.code().as_deref(), Some("2067"));
        assert_eq!(err.message(), "UNIQUE constraint failed: Users.email");
    }
}
