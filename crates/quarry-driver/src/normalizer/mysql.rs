use once_cell::sync::Lazy;
use quarry_core::{CanonicalError, DriverError, ErrorKind, Provider};

use super::{ErrorNormalizer, PatternRule, PatternTable};

/// MySQL server error numbers, see
/// <https://dev.mysql.com/doc/mysql-errors/8.0/en/server-error-reference.html>.
pub static MYSQL_PATTERNS: Lazy<PatternTable> = Lazy::new(|| PatternTable {
    provider: Provider::Mysql,
    version: 1,
    rules: vec![
        PatternRule::new(
            "duplicate_entry",
            &["1062"],
            Some(r"for key '(?P<index>[^']+)'"),
            ErrorKind::UniqueConstraintViolation,
        ),
        PatternRule::new(
            "duplicate_entry_bare",
            &["1062"],
            None,
            ErrorKind::UniqueConstraintViolation,
        ),
        PatternRule::new(
            "column_cannot_be_null",
            &["1048"],
            Some(r"Column '(?P<fields>[^']+)' cannot be null"),
            ErrorKind::NullConstraintViolation,
        ),
        PatternRule::new(
            "field_without_default",
            &["1364"],
            Some(r"Field '(?P<fields>[^']+)' doesn't have a default value"),
            ErrorKind::NullConstraintViolation,
        ),
        PatternRule::new(
            "foreign_key_fields",
            &["1451", "1452"],
            Some(r"FOREIGN KEY \(`(?P<fields>[^`]+)`\)"),
            ErrorKind::ForeignKeyConstraintViolation,
        ),
        PatternRule::new(
            "foreign_key",
            &["1451", "1452"],
            None,
            ErrorKind::ForeignKeyConstraintViolation,
        ),
        PatternRule::new(
            "no_such_table",
            &["1146"],
            Some(r"Table '(?P<table>[^']+)' doesn't exist"),
            ErrorKind::TableDoesNotExist,
        ),
        PatternRule::new(
            "unknown_column",
            &["1054"],
            Some(r"Unknown column '(?P<column>[^']+)'"),
            ErrorKind::ColumnNotFound,
        ),
        PatternRule::new(
            "lock_wait_timeout",
            &["1205"],
            None,
            ErrorKind::SocketTimeout,
        ),
        PatternRule::new(
            "deadlock",
            &["1213"],
            None,
            ErrorKind::TransactionWriteConflict,
        ),
    ],
});

/// Strategy for MySQL/MariaDB drivers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlNormalizer;

impl ErrorNormalizer for MysqlNormalizer {
    fn provider(&self) -> Provider {
        Provider::Mysql
    }

    fn classify(&self, error: &DriverError, message: &str) -> Option<CanonicalError> {
        MYSQL_PATTERNS.classify(error.code().as_deref(), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::NormalizerRegistry;
    use quarry_core::Constraint;

    fn normalize(code: u16, message: &str) -> CanonicalError {
        NormalizerRegistry::with_builtin().normalize(
            Provider::Mysql,
            &DriverError::Mysql {
                code,
                state: "HY000".into(),
                message: message.to_string(),
            },
        )
    }

    #[test]
    fn test_duplicate_entry_names_the_index() {
        let err = normalize(1062, "Duplicate entry 'a@b.c' for key 'users.users_email_key'");
        assert_eq!(err.kind, ErrorKind::UniqueConstraintViolation);
        assert_eq!(
            err.constraint,
            Some(Constraint::Index("users.users_email_key".into()))
        );
    }

    #[test]
    fn test_null_column() {
        let err = normalize(1048, "Column 'name' cannot be null");
        assert_eq!(err.kind, ErrorKind::NullConstraintViolation);
        assert_eq!(err.constraint, Some(Constraint::Fields(vec!["name".into()])));
    }

    #[test]
    fn test_foreign_key_failure_reports_field() {
        let err = normalize(
            1452,
            "Cannot add or update a child row: a foreign key constraint fails (`db`.`posts`, CONSTRAINT `posts_author_fk` FOREIGN KEY (`author_id`) REFERENCES `users` (`id`))",
        );
        assert_eq!(err.kind, ErrorKind::ForeignKeyConstraintViolation);
        assert_eq!(
            err.constraint,
            Some(Constraint::Fields(vec!["author_id".into()]))
        );
    }

    #[test]
    fn test_missing_table_drops_schema() {
        let err = normalize(1146, "Table 'shop.widgets' doesn't exist");
        assert_eq!(err.table.as_deref(), Some("widgets"));
    }

    #[test]
    fn test_unknown_column() {
        let err = normalize(1054, "Unknown column 'nickname' in 'field list'");
        assert_eq!(err.kind, ErrorKind::ColumnNotFound);
        assert_eq!(err.column.as_deref(), Some("nickname"));
    }

    #[test]
    fn test_lock_wait_and_deadlock() {
        assert_eq!(
            normalize(1205, "Lock wait timeout exceeded").kind,
            ErrorKind::SocketTimeout
        );
        assert_eq!(
            normalize(1213, "Deadlock found when trying to get lock").kind,
            ErrorKind::TransactionWriteConflict
        );
    }
}
