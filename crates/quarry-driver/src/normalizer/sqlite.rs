use once_cell::sync::Lazy;
use quarry_core::{CanonicalError, DriverError, ErrorKind, Provider};

use super::{ErrorNormalizer, PatternRule, PatternTable};

/// SQLite extended result codes, see <https://www.sqlite.org/rescode.html>.
pub static SQLITE_PATTERNS: Lazy<PatternTable> = Lazy::new(|| PatternTable {
    provider: Provider::Sqlite,
    version: 1,
    rules: vec![
        PatternRule::new(
            "unique_index",
            &["2067", "1555"],
            Some(r"constraint failed: index '(?P<index>[^']+)'"),
            ErrorKind::UniqueConstraintViolation,
        ),
        PatternRule::new(
            "unique_fields",
            &["2067", "1555"],
            Some(r"constraint failed: (?P<fields>.+)$"),
            ErrorKind::UniqueConstraintViolation,
        ),
        PatternRule::new(
            "unique",
            &["2067", "1555"],
            None,
            ErrorKind::UniqueConstraintViolation,
        ),
        PatternRule::new(
            "not_null",
            &["1299"],
            Some(r"constraint failed: (?P<fields>.+)$"),
            ErrorKind::NullConstraintViolation,
        ),
        PatternRule::new(
            "foreign_key",
            &["787"],
            None,
            ErrorKind::ForeignKeyConstraintViolation,
        ),
        PatternRule::new(
            "busy",
            &["5", "261", "517", "6", "262"],
            None,
            ErrorKind::SocketTimeout,
        ),
        PatternRule::new(
            "no_such_table",
            &[],
            Some(r"no such table: (?P<table>\S+)"),
            ErrorKind::TableDoesNotExist,
        ),
        PatternRule::new(
            "no_such_column",
            &[],
            Some(r"no such column: (?P<column>\S+)"),
            ErrorKind::ColumnNotFound,
        ),
        PatternRule::new(
            "has_no_column",
            &[],
            Some(r"has no column named (?P<column>\S+)"),
            ErrorKind::ColumnNotFound,
        ),
        PatternRule::new(
            "unique_message",
            &[],
            Some(r"UNIQUE constraint failed: (?P<fields>.+)$"),
            ErrorKind::UniqueConstraintViolation,
        ),
        PatternRule::new(
            "not_null_message",
            &[],
            Some(r"NOT NULL constraint failed: (?P<fields>.+)$"),
            ErrorKind::NullConstraintViolation,
        ),
        PatternRule::new(
            "foreign_key_message",
            &[],
            Some(r"FOREIGN KEY constraint failed"),
            ErrorKind::ForeignKeyConstraintViolation,
        ),
    ],
});

/// Strategy for SQLite-family drivers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteNormalizer;

impl ErrorNormalizer for SqliteNormalizer {
    fn provider(&self) -> Provider {
        Provider::Sqlite
    }

    fn classify(&self, error: &DriverError, message: &str) -> Option<CanonicalError> {
        SQLITE_PATTERNS.classify(error.code().as_deref(), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::NormalizerRegistry;
    use quarry_core::Constraint;

    fn normalize(extended_code: i32, message: &str) -> CanonicalError {
        NormalizerRegistry::with_builtin().normalize(
            Provider::Sqlite,
            &DriverError::Sqlite {
                extended_code,
                message: message.to_string(),
            },
        )
    }

    #[test]
    fn test_unique_violation_extracts_fields() {
        let err = normalize(2067, "constraint failed: Users.email, Users.name");
        assert_eq!(err.kind, ErrorKind::UniqueConstraintViolation);
        assert_eq!(
            err.constraint,
            Some(Constraint::Fields(vec!["email".into(), "name".into()]))
        );
        assert_eq!(err.original_code.as_deref(), Some("2067"));
    }

    #[test]
    fn test_unique_violation_on_named_index() {
        let err = normalize(2067, "UNIQUE constraint failed: index 'users_email_key'");
        assert_eq!(
            err.constraint,
            Some(Constraint::Index("users_email_key".into()))
        );
    }

    #[test]
    fn test_primary_key_violation_is_unique() {
        let err = normalize(1555, "UNIQUE constraint failed: Users.id");
        assert_eq!(err.kind, ErrorKind::UniqueConstraintViolation);
        assert_eq!(err.constraint, Some(Constraint::Fields(vec!["id".into()])));
    }

    #[test]
    fn test_not_null_violation() {
        let err = normalize(1299, "NOT NULL constraint failed: Users.name");
        assert_eq!(err.kind, ErrorKind::NullConstraintViolation);
        assert_eq!(err.constraint, Some(Constraint::Fields(vec!["name".into()])));
    }

    #[test]
    fn test_foreign_key_violation() {
        let err = normalize(787, "FOREIGN KEY constraint failed");
        assert_eq!(err.kind, ErrorKind::ForeignKeyConstraintViolation);
        assert_eq!(err.constraint, Some(Constraint::ForeignKey {}));
    }

    #[test]
    fn test_missing_table_carries_table_name() {
        let err = normalize(1, "no such table: Widgets");
        assert_eq!(err.kind, ErrorKind::TableDoesNotExist);
        assert_eq!(err.table.as_deref(), Some("Widgets"));

        let prefixed = normalize(1, "SQLITE_ERROR: no such table: main.Gadgets");
        assert_eq!(prefixed.table.as_deref(), Some("Gadgets"));
    }

    #[test]
    fn test_missing_column_carries_column_name() {
        let err = normalize(1, "no such column: Users.nickname");
        assert_eq!(err.kind, ErrorKind::ColumnNotFound);
        assert_eq!(err.column.as_deref(), Some("nickname"));

        let insert = normalize(1, "table Users has no column named nickname");
        assert_eq!(insert.column.as_deref(), Some("nickname"));
    }

    #[test]
    fn test_busy_database_is_a_timeout() {
        let err = normalize(5, "database is locked");
        assert_eq!(err.kind, ErrorKind::SocketTimeout);
    }

    #[test]
    fn test_unrecognised_error_is_unknown() {
        let err = normalize(13, "database or disk is full");
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert_eq!(err.original_message.as_deref(), Some("database or disk is full"));
    }

    #[test]
    fn test_pattern_table_is_versioned() {
        assert!(SQLITE_PATTERNS.version >= 1);
        assert!(SQLITE_PATTERNS
            .rules
            .iter()
            .all(|rule| rule.kind != ErrorKind::Unknown));
    }
}
