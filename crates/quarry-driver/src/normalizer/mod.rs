//! Translation of native driver errors into [`CanonicalError`]s.
//!
//! Each dialect contributes a [`PatternTable`]: an ordered, versioned list of
//! code/message rules. The first rule that matches decides the kind; named
//! regex groups (`fields`, `index`, `table`, `column`) carry the offending
//! identifiers through. Errors no rule recognises become `Unknown` with the
//! native code and message preserved.

mod mysql;
mod postgres;
mod sqlite;

use std::collections::HashMap;
use std::sync::Arc;

use quarry_core::{CanonicalError, Constraint, DriverError, ErrorKind, Provider};
use regex::{Captures, Regex};
use tracing::debug;

use crate::redact::redact_connection_strings;

pub use mysql::{MysqlNormalizer, MYSQL_PATTERNS};
pub use postgres::{PostgresNormalizer, POSTGRES_PATTERNS};
pub use sqlite::{SqliteNormalizer, SQLITE_PATTERNS};

/// Dialect-specific error translation strategy.
pub trait ErrorNormalizer: Send + Sync {
    fn provider(&self) -> Provider;

    /// Classifies a native error, or `None` when no pattern recognises it.
    ///
    /// `message` is the native message with connection strings redacted.
    fn classify(&self, error: &DriverError, message: &str) -> Option<CanonicalError>;
}

/// One recognisable native error shape.
#[derive(Debug)]
pub struct PatternRule {
    /// Stable name, used in logs and tests.
    pub name: &'static str,
    /// Native codes this rule applies to; empty matches any code.
    pub codes: &'static [&'static str],
    /// Message pattern; `None` matches any message.
    pub message: Option<Regex>,
    pub kind: ErrorKind,
}

/// Ordered rule list for one dialect.
#[derive(Debug)]
pub struct PatternTable {
    pub provider: Provider,
    /// Bumped whenever a rule is added, removed or reordered.
    pub version: u32,
    pub rules: Vec<PatternRule>,
}

impl PatternRule {
    pub(crate) fn new(
        name: &'static str,
        codes: &'static [&'static str],
        message: Option<&str>,
        kind: ErrorKind,
    ) -> Self {
        Self {
            name,
            codes,
            message: message.map(|pattern| {
                Regex::new(pattern).unwrap_or_else(|e| panic!("invalid pattern for {name}: {e}"))
            }),
            kind,
        }
    }
}

impl PatternTable {
    /// Finds the first matching rule and builds the canonical error.
    #[must_use]
    pub fn classify(&self, code: Option<&str>, message: &str) -> Option<CanonicalError> {
        for rule in &self.rules {
            let code_matches =
                rule.codes.is_empty() || code.is_some_and(|code| rule.codes.contains(&code));
            if !code_matches {
                continue;
            }
            let captures = match &rule.message {
                Some(pattern) => match pattern.captures(message) {
                    Some(captures) => Some(captures),
                    None => continue,
                },
                None => None,
            };
            debug!(
                provider = %self.provider,
                rule = rule.name,
                version = self.version,
                "Native error matched pattern"
            );
            return Some(build(rule.kind, captures.as_ref()));
        }
        None
    }
}

fn build(kind: ErrorKind, captures: Option<&Captures<'_>>) -> CanonicalError {
    let group = |name: &str| {
        captures
            .and_then(|c| c.name(name))
            .map(|m| m.as_str().to_string())
    };

    let constraint = if let Some(fields) = group("fields") {
        Some(Constraint::Fields(split_fields(&fields)))
    } else if let Some(index) = group("index") {
        Some(Constraint::Index(unquote(&index).to_string()))
    } else if kind == ErrorKind::ForeignKeyConstraintViolation {
        Some(Constraint::ForeignKey {})
    } else {
        None
    };

    let mut error = CanonicalError::new(kind, String::new());
    if let Some(constraint) = constraint {
        error = error.with_constraint(constraint);
    }
    if let Some(table) = group("table") {
        error = error.with_table(unqualify(&table));
    }
    if let Some(column) = group("column") {
        error = error.with_column(unqualify(&column));
    }
    error.message = describe(&error);
    error
}

/// Splits `Users.email, Users.name` (or quoted variants) into bare field names.
pub(crate) fn split_fields(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(unqualify)
        .collect()
}

fn unquote(identifier: &str) -> &str {
    identifier.trim_matches(|c| matches!(c, '"' | '\'' | '`'))
}

/// Drops schema/table qualifiers: `main.Users` becomes `Users`.
fn unqualify(identifier: &str) -> String {
    let bare = unquote(identifier.trim());
    bare.rsplit('.').next().map_or(bare, unquote).to_string()
}

/// Human-readable message for a canonical error.
pub(crate) fn describe(error: &CanonicalError) -> String {
    let constraint = match &error.constraint {
        Some(Constraint::Fields(fields)) => format!(
            " on the fields: ({})",
            fields
                .iter()
                .map(|f| format!("`{f}`"))
                .collect::<Vec<_>>()
                .join(",")
        ),
        Some(Constraint::Index(index)) => format!(" on the constraint: `{index}`"),
        Some(Constraint::ForeignKey {}) | None => String::new(),
    };
    match error.kind {
        ErrorKind::UniqueConstraintViolation => format!("Unique constraint failed{constraint}"),
        ErrorKind::NullConstraintViolation => format!("Null constraint violation{constraint}"),
        ErrorKind::ForeignKeyConstraintViolation => {
            format!("Foreign key constraint violated{constraint}")
        }
        ErrorKind::TableDoesNotExist => format!(
            "The table `{}` does not exist in the current database.",
            error.table.as_deref().unwrap_or("(not available)")
        ),
        ErrorKind::ColumnNotFound => format!(
            "The column `{}` does not exist in the current database.",
            error.column.as_deref().unwrap_or("(not available)")
        ),
        ErrorKind::SocketTimeout => "Operation has timed out".to_string(),
        ErrorKind::TransactionWriteConflict => {
            "Transaction failed due to a write conflict or a deadlock".to_string()
        }
        other => other.to_string(),
    }
}

/// Maps each provider to its normalizer; consulted on every driver error.
#[derive(Clone, Default)]
pub struct NormalizerRegistry {
    normalizers: HashMap<Provider, Arc<dyn ErrorNormalizer>>,
}

impl NormalizerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the SQLite, Postgres and MySQL strategies registered.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SqliteNormalizer));
        registry.register(Arc::new(PostgresNormalizer));
        registry.register(Arc::new(MysqlNormalizer));
        registry
    }

    /// Registers (or replaces) the strategy for the normalizer's provider.
    pub fn register(&mut self, normalizer: Arc<dyn ErrorNormalizer>) {
        self.normalizers.insert(normalizer.provider(), normalizer);
    }

    #[must_use]
    pub fn supports(&self, provider: Provider) -> bool {
        self.normalizers.contains_key(&provider)
    }

    /// Turns a native error into the canonical shape.
    ///
    /// Never fails: unrecognised errors become `Unknown` with the original
    /// code and (redacted) message attached.
    #[must_use]
    pub fn normalize(&self, provider: Provider, error: &DriverError) -> CanonicalError {
        if let DriverError::Mapped(mapped) = error {
            return mapped.clone();
        }

        let code = error.code();
        let message = redact_connection_strings(error.message()).into_owned();
        let classified = self
            .normalizers
            .get(&provider)
            .and_then(|normalizer| normalizer.classify(error, &message));

        match classified {
            Some(canonical) => canonical.with_original(code, message),
            None => {
                debug!(%provider, code = ?code, "Native error did not match any pattern");
                CanonicalError::unknown(code, message)
            }
        }
    }
}

impl std::fmt::Debug for NormalizerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NormalizerRegistry")
            .field("providers", &self.normalizers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapped_errors_pass_through_unchanged() {
        let registry = NormalizerRegistry::with_builtin();
        let mapped = CanonicalError::conversion("isolation level not supported");
        let normalized = registry.normalize(Provider::Sqlite, &DriverError::Mapped(mapped.clone()));
        assert_eq!(normalized, mapped);
    }

    #[test]
    fn test_unknown_errors_keep_code_and_message() {
        let registry = NormalizerRegistry::with_builtin();
        let error = DriverError::Sqlite {
            extended_code: 11,
            message: "database disk image is malformed".into(),
        };
        let normalized = registry.normalize(Provider::Sqlite, &error);
        assert_eq!(normalized.kind, ErrorKind::Unknown);
        assert_eq!(normalized.original_code.as_deref(), Some("11"));
        assert_eq!(
            normalized.original_message.as_deref(),
            Some("database disk image is malformed")
        );
    }

    #[test]
    fn test_unregistered_provider_yields_unknown() {
        let registry = NormalizerRegistry::new();
        let error = DriverError::Mysql {
            code: 1062,
            state: "23000".into(),
            message: "Duplicate entry '1' for key 'PRIMARY'".into(),
        };
        assert_eq!(
            registry.normalize(Provider::Mysql, &error).kind,
            ErrorKind::Unknown
        );
        assert!(!registry.supports(Provider::Mysql));
    }

    #[test]
    fn test_original_messages_are_redacted() {
        let registry = NormalizerRegistry::with_builtin();
        let error = DriverError::other("cannot reach postgres://admin:secret@db:5432/app");
        let normalized = registry.normalize(Provider::Postgres, &error);
        assert_eq!(
            normalized.original_message.as_deref(),
            Some("cannot reach [REDACTED]")
        );
    }

    #[test]
    fn test_field_lists_lose_qualifiers_and_quotes() {
        assert_eq!(
            split_fields("Users.email, \"Users\".\"name\""),
            vec!["email".to_string(), "name".to_string()]
        );
    }
}
