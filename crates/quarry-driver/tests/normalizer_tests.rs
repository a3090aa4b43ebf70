//! Cross-dialect normalization and mock pool behaviour.

use std::time::Duration;

use quarry_core::{Constraint, DriverError, ErrorKind, Provider, Queryable, SqlQuery};
use quarry_driver::{MockConfig, MockDriverAdapter, NormalizerRegistry};

fn postgres(code: &str, message: &str, detail: Option<&str>) -> DriverError {
    DriverError::Postgres {
        code: code.to_string(),
        message: message.to_string(),
        severity: Some("ERROR".to_string()),
        detail: detail.map(str::to_string),
        column: None,
        table: None,
        constraint: None,
    }
}

#[test]
fn test_unique_violation_is_the_same_kind_in_every_dialect() {
    let registry = NormalizerRegistry::with_builtin();
    let cases = [
        (
            Provider::Sqlite,
            DriverError::Sqlite {
                extended_code: 2067,
                message: "UNIQUE constraint failed: users.email".to_string(),
            },
        ),
        (
            Provider::Postgres,
            postgres(
                "23505",
                "duplicate key value violates unique constraint \"users_email_key\"",
                Some("Key (email)=(a@b.c) already exists."),
            ),
        ),
        (
            Provider::Mysql,
            DriverError::Mysql {
                code: 1062,
                state: "23000".to_string(),
                message: "Duplicate entry 'a@b.c' for key 'users_email_key'".to_string(),
            },
        ),
    ];

    for (provider, error) in &cases {
        let normalized = registry.normalize(*provider, error);
        assert_eq!(
            normalized.kind,
            ErrorKind::UniqueConstraintViolation,
            "{provider}: {normalized:?}"
        );
        assert_eq!(normalized.original_message.as_deref(), Some(error.message()));
    }

    let sqlite = registry.normalize(cases[0].0, &cases[0].1);
    let pg = registry.normalize(cases[1].0, &cases[1].1);
    assert_eq!(sqlite.constraint, Some(Constraint::Fields(vec!["email".into()])));
    assert_eq!(pg.constraint, sqlite.constraint);
}

#[test]
fn test_connection_strings_never_reach_the_caller() {
    let registry = NormalizerRegistry::with_builtin();
    let error = DriverError::Other {
        code: None,
        message: "could not connect to postgres://admin:secret@db:5432/app".to_string(),
    };
    let normalized = registry.normalize(Provider::Postgres, &error);

    assert_eq!(normalized.kind, ErrorKind::Unknown);
    let message = normalized.original_message.unwrap_or_default();
    assert!(!message.contains("secret"));
    assert!(message.contains("[REDACTED]"));
}

#[test]
fn test_write_conflict_is_retryable() {
    let registry = NormalizerRegistry::with_builtin();
    let normalized = registry.normalize(
        Provider::Postgres,
        &postgres("40001", "could not serialize access due to concurrent update", None),
    );
    assert_eq!(normalized.kind, ErrorKind::TransactionWriteConflict);
    assert!(normalized.kind.is_retryable());
}

#[tokio::test]
async fn test_normalization_is_deterministic_across_tasks() {
    let registry = NormalizerRegistry::with_builtin();
    let error = DriverError::Sqlite {
        extended_code: 1,
        message: "no such table: main.Widgets".to_string(),
    };
    let expected = registry.normalize(Provider::Sqlite, &error);
    assert_eq!(expected.table.as_deref(), Some("Widgets"));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            let error = error.clone();
            tokio::spawn(async move { registry.normalize(Provider::Sqlite, &error) })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), expected);
    }
}

#[tokio::test(start_paused = true)]
async fn test_mock_pool_bounds_concurrent_statements() {
    let mock = MockDriverAdapter::with_config(MockConfig {
        pool_size: 2,
        latency: Duration::from_millis(50),
        ..MockConfig::default()
    });

    let started = tokio::time::Instant::now();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let mock = mock.clone();
            tokio::spawn(async move {
                mock.query_raw(&SqlQuery::raw(format!("SELECT {i}"))).await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(mock.available_connections(), 2);
    assert_eq!(mock.statements("query").len(), 4);
}
