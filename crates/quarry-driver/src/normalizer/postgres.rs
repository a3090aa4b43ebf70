use once_cell::sync::Lazy;
use quarry_core::{CanonicalError, Constraint, DriverError, ErrorKind, Provider};
use regex::Regex;

use super::{describe, split_fields, ErrorNormalizer, PatternRule, PatternTable};

/// SQLSTATE codes, see <https://www.postgresql.org/docs/current/errcodes-appendix.html>.
pub static POSTGRES_PATTERNS: Lazy<PatternTable> = Lazy::new(|| PatternTable {
    provider: Provider::Postgres,
    version: 1,
    rules: vec![
        PatternRule::new(
            "unique",
            &["23505"],
            None,
            ErrorKind::UniqueConstraintViolation,
        ),
        PatternRule::new(
            "not_null",
            &["23502"],
            Some(r#"column "(?P<fields>[^"]+)""#),
            ErrorKind::NullConstraintViolation,
        ),
        PatternRule::new(
            "not_null_bare",
            &["23502"],
            None,
            ErrorKind::NullConstraintViolation,
        ),
        PatternRule::new(
            "foreign_key",
            &["23503"],
            None,
            ErrorKind::ForeignKeyConstraintViolation,
        ),
        PatternRule::new(
            "undefined_table",
            &["42P01"],
            Some(r#"relation "(?P<table>[^"]+)" does not exist"#),
            ErrorKind::TableDoesNotExist,
        ),
        PatternRule::new(
            "undefined_table_bare",
            &["42P01"],
            None,
            ErrorKind::TableDoesNotExist,
        ),
        PatternRule::new(
            "undefined_column",
            &["42703"],
            Some(r#"column "(?P<column>[^"]+)""#),
            ErrorKind::ColumnNotFound,
        ),
        PatternRule::new(
            "serialization_failure",
            &["40001", "40P01"],
            None,
            ErrorKind::TransactionWriteConflict,
        ),
        PatternRule::new(
            "timeout",
            &["57014", "55P03"],
            None,
            ErrorKind::SocketTimeout,
        ),
    ],
});

static KEY_DETAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Key \((?P<fields>[^)]+)\)=").expect("key detail pattern is valid")
});

/// Strategy for Postgres-family drivers.
///
/// Postgres reports structured fields next to the message; those win over
/// anything parsed from free text.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresNormalizer;

impl ErrorNormalizer for PostgresNormalizer {
    fn provider(&self) -> Provider {
        Provider::Postgres
    }

    fn classify(&self, error: &DriverError, message: &str) -> Option<CanonicalError> {
        let mut canonical = POSTGRES_PATTERNS.classify(error.code().as_deref(), message)?;

        let DriverError::Postgres {
            detail,
            column,
            table,
            constraint,
            ..
        } = error
        else {
            return Some(canonical);
        };

        match canonical.kind {
            ErrorKind::UniqueConstraintViolation => {
                let fields = detail
                    .as_deref()
                    .and_then(|detail| KEY_DETAIL.captures(detail))
                    .and_then(|c| c.name("fields"))
                    .map(|m| split_fields(m.as_str()));
                canonical.constraint = match (fields, constraint) {
                    (Some(fields), _) => Some(Constraint::Fields(fields)),
                    (None, Some(index)) => Some(Constraint::Index(index.clone())),
                    (None, None) => None,
                };
            }
            ErrorKind::NullConstraintViolation => {
                if let Some(column) = column {
                    canonical.constraint = Some(Constraint::Fields(vec![column.clone()]));
                }
            }
            ErrorKind::ForeignKeyConstraintViolation => {
                if let Some(index) = constraint {
                    canonical.constraint = Some(Constraint::Index(index.clone()));
                }
            }
            _ => {}
        }
        if canonical.table.is_none() {
            canonical.table = table.clone();
        }
        if canonical.column.is_none() && canonical.kind == ErrorKind::ColumnNotFound {
            canonical.column = column.clone();
        }
        canonical.message = describe(&canonical);
        Some(canonical)
    }
}
