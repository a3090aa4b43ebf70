//! Plan execution tests against the scripted mock adapter.

use std::sync::Arc;
use std::time::Duration;

use quarry_core::{
    Arity, BatchMode, BatchNode, ColumnType, DriverAdapter, DriverError, ErrorKind, Fragment,
    JoinChild, JoinNode, MapOp, MapResultNode, NodeId, Param, PlaceholderFormat, PlanNode,
    PlanNodeKind, QueryKind, QueryNode, QueryPlan, ResourceLimits, ResultSet, Statement,
    TransactionBoundaryNode, Value,
};
use quarry_driver::{MockConfig, MockDriverAdapter, MockResponse};
use quarry_driver::NormalizerRegistry;
use quarry_query::{
    BatchFailurePolicy, BatchOutcome, CancellationToken, InterpreterOptions, Output,
    QueryInterpreter, TransactionManager, TransactionState,
};

fn interpreter(mock: &MockDriverAdapter, limits: ResourceLimits) -> QueryInterpreter {
    let adapter: Arc<dyn DriverAdapter> = Arc::new(mock.clone());
    let registry = NormalizerRegistry::with_builtin();
    let transactions = TransactionManager::new(Arc::clone(&adapter), registry.clone(), limits);
    QueryInterpreter::new(adapter, registry, transactions, limits)
}

fn statement(id: &str, sql: &str, params: Vec<Param>, kind: QueryKind) -> PlanNode {
    PlanNode::new(
        id,
        PlanNodeKind::Query(QueryNode {
            statement: Statement::Raw {
                sql: sql.to_string(),
                params,
            },
            kind,
        }),
    )
}

fn read(id: &str, sql: &str) -> PlanNode {
    statement(id, sql, Vec::new(), QueryKind::Read)
}

fn write(id: &str, sql: &str) -> PlanNode {
    statement(id, sql, Vec::new(), QueryKind::Write)
}

fn batch(id: &str, mode: BatchMode, children: Vec<PlanNode>) -> PlanNode {
    PlanNode::new(
        id,
        PlanNodeKind::Batch(BatchNode {
            mode,
            isolation_level: None,
            children,
        }),
    )
}

fn reference(node: &str, field: &str, arity: Arity) -> Param {
    Param::Ref {
        node: NodeId::from(node),
        field: field.to_string(),
        arity,
    }
}

fn users(ids: &[Option<i64>]) -> ResultSet {
    ids.iter().fold(
        ResultSet::new(vec![
            ("id".into(), ColumnType::Int64),
            ("name".into(), ColumnType::Text),
        ]),
        |rows, id| {
            rows.with_row(vec![
                id.map_or(Value::Null, Value::Int),
                Value::Text(format!("user-{}", id.unwrap_or_default())),
            ])
        },
    )
}

fn unique_violation() -> DriverError {
    DriverError::Sqlite {
        extended_code: 2067,
        message: "UNIQUE constraint failed: users.email".to_string(),
    }
}

fn ids_of(records: &[quarry_core::Record], field: &str) -> Vec<Value> {
    records
        .iter()
        .map(|record| record.get(field).cloned().unwrap_or(Value::Null))
        .collect()
}

#[tokio::test]
async fn test_single_query_returns_rows_in_order() {
    let mock = MockDriverAdapter::new();
    mock.on_query("FROM users", users(&[Some(3), Some(1), Some(2)]));
    let interpreter = interpreter(&mock, ResourceLimits::default());

    let output = interpreter
        .execute(
            &QueryPlan::new(read("users", "SELECT id, name FROM users")),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let records = output.into_records().unwrap();
    assert_eq!(
        ids_of(&records, "id"),
        vec![Value::Int(3), Value::Int(1), Value::Int(2)]
    );
    assert_eq!(records[0]["name"], Value::from("user-3"));
}

#[tokio::test]
async fn test_empty_plan_yields_no_records() {
    let mock = MockDriverAdapter::new();
    let interpreter = interpreter(&mock, ResourceLimits::default());
    let output = interpreter
        .execute(&QueryPlan::default(), None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(output, Output::Records(Vec::new()));
    assert!(mock.call_history().is_empty());
}

#[tokio::test]
async fn test_transactional_batch_rolls_back_on_failure() {
    let mock = MockDriverAdapter::new();
    mock.fail_on("INSERT INTO users", unique_violation());
    let interpreter = interpreter(&mock, ResourceLimits::default());

    let plan = QueryPlan::new(batch(
        "batch",
        BatchMode::Transactional,
        vec![
            write("account", "INSERT INTO accounts (id) VALUES (1)"),
            write("user", "INSERT INTO users (email) VALUES ('a@b.c')"),
            write("audit", "INSERT INTO audit (event) VALUES ('signup')"),
        ],
    ));
    let err = interpreter
        .execute(&plan, None, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::UniqueConstraintViolation);
    assert!(mock.committed_writes().is_empty());
    assert!(!mock
        .statements("execute")
        .iter()
        .any(|sql| sql.contains("INSERT INTO audit")));
    assert!(mock.statements("execute").contains(&"ROLLBACK".to_string()));
    let history = interpreter.transactions().history();
    assert_eq!(history.last().map(|(_, state)| *state), Some(TransactionState::RolledBack));
    assert_eq!(mock.open_transactions(), 0);
}

#[tokio::test]
async fn test_transactional_batch_commits_all_writes() {
    let mock = MockDriverAdapter::new();
    mock.on_execute("INSERT INTO users", 2);
    let interpreter = interpreter(&mock, ResourceLimits::default());

    let plan = QueryPlan::new(batch(
        "batch",
        BatchMode::Transactional,
        vec![
            write("account", "INSERT INTO accounts (id) VALUES (1)"),
            write("users", "INSERT INTO users (email) VALUES ('a'), ('b')"),
        ],
    ));
    let output = interpreter
        .execute(&plan, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        output,
        Output::Batch(vec![
            BatchOutcome::Data(Output::Affected(1)),
            BatchOutcome::Data(Output::Affected(2)),
        ])
    );
    assert_eq!(mock.committed_writes().len(), 2);
    assert_eq!(mock.statements("begin").len(), 1);
}

#[tokio::test]
async fn test_independent_batch_reports_each_outcome() {
    let mock = MockDriverAdapter::new();
    mock.on_query("FROM users", users(&[Some(1)]));
    mock.fail_on("INSERT INTO users", unique_violation());
    let plan = QueryPlan::new(batch(
        "batch",
        BatchMode::Independent,
        vec![
            read("before", "SELECT id, name FROM users"),
            write("insert", "INSERT INTO users (email) VALUES ('a@b.c')"),
            read("after", "SELECT id, name FROM users"),
        ],
    ));

    let continuing = interpreter(&mock, ResourceLimits::default());
    let Output::Batch(outcomes) = continuing
        .execute(&plan, None, &CancellationToken::new())
        .await
        .unwrap()
    else {
        panic!("expected batch output");
    };
    assert!(matches!(outcomes[0], BatchOutcome::Data(Output::Records(_))));
    assert!(
        matches!(&outcomes[1], BatchOutcome::Error(e) if e.kind == ErrorKind::UniqueConstraintViolation)
    );
    assert!(matches!(outcomes[2], BatchOutcome::Data(Output::Records(_))));

    let aborting = interpreter(&mock, ResourceLimits::default()).with_options(InterpreterOptions {
        batch_failure_policy: BatchFailurePolicy::Abort,
        default_isolation_level: None,
    });
    let Output::Batch(outcomes) = aborting
        .execute(&plan, None, &CancellationToken::new())
        .await
        .unwrap()
    else {
        panic!("expected batch output");
    };
    assert!(outcomes[1].is_error());
    assert_eq!(outcomes[2], BatchOutcome::Skipped);
}

#[tokio::test]
async fn test_join_attaches_children_per_parent() {
    let mock = MockDriverAdapter::new();
    mock.on_query("FROM users", users(&[Some(1), Some(2), Some(3), None]));
    mock.on_statement(|query| {
        if !query.sql.contains("FROM posts") {
            return None;
        }
        let author = query.args.first().and_then(Value::as_i64)?;
        let titles: &[&str] = match author {
            1 => &["first", "second"],
            3 => &["third"],
            _ => &[],
        };
        let rows = titles.iter().fold(
            ResultSet::new(vec![
                ("author_id".into(), ColumnType::Int64),
                ("title".into(), ColumnType::Text),
            ]),
            |rows, title| rows.with_row(vec![Value::Int(author), Value::from(*title)]),
        );
        Some(MockResponse::Rows(rows))
    });
    let interpreter = interpreter(&mock, ResourceLimits::default());

    let plan = QueryPlan::new(PlanNode::new(
        "join",
        PlanNodeKind::Join(JoinNode {
            parent: Box::new(read("users", "SELECT id, name FROM users")),
            children: vec![JoinChild {
                child: statement(
                    "posts",
                    "SELECT author_id, title FROM posts WHERE author_id = ?",
                    vec![reference("users", "id", Arity::Scalar)],
                    QueryKind::Read,
                ),
                on: vec![("id".into(), "author_id".into())],
                attach_as: "posts".into(),
                unique: false,
            }],
        }),
    ));
    let records = interpreter
        .execute(&plan, None, &CancellationToken::new())
        .await
        .unwrap()
        .into_records()
        .unwrap();

    assert_eq!(records.len(), 4);
    let post_counts: Vec<usize> = records
        .iter()
        .map(|record| match &record["posts"] {
            Value::List(posts) => posts.len(),
            other => panic!("expected list, got {other:?}"),
        })
        .collect();
    assert_eq!(post_counts, vec![2, 0, 1, 0]);
    // One statement per distinct non-null parent key.
    assert_eq!(mock.statements("query").len(), 4);
}

#[tokio::test]
async fn test_dependent_query_skipped_when_parent_is_empty() {
    let mock = MockDriverAdapter::new();
    mock.on_query("FROM users", users(&[]));
    let interpreter = interpreter(&mock, ResourceLimits::default());

    let plan = QueryPlan::new(batch(
        "batch",
        BatchMode::Independent,
        vec![
            read("users", "SELECT id, name FROM users WHERE banned"),
            statement(
                "cleanup",
                "DELETE FROM sessions WHERE user_id IN (?)",
                vec![reference("users", "id", Arity::List)],
                QueryKind::Write,
            ),
        ],
    ));
    let output = interpreter
        .execute(&plan, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        output,
        Output::Batch(vec![
            BatchOutcome::Data(Output::Records(Vec::new())),
            BatchOutcome::Data(Output::Affected(0)),
        ])
    );
    assert!(mock.statements("execute").is_empty());
}

#[tokio::test]
async fn test_oversized_list_is_chunked_and_merged() {
    let mock = MockDriverAdapter::with_config(MockConfig {
        max_bind_values: Some(3),
        ..MockConfig::default()
    });
    mock.on_statement(|query| {
        let ids: Vec<Option<i64>> = query.args.iter().map(|arg| arg.as_i64()).collect();
        Some(MockResponse::Rows(users(&ids)))
    });
    let interpreter = interpreter(&mock, ResourceLimits::default());

    let plan = QueryPlan::new(PlanNode::new(
        "users",
        PlanNodeKind::Query(QueryNode {
            statement: Statement::Template {
                fragments: vec![
                    Fragment::Text {
                        chunk: "SELECT id, name FROM users WHERE id IN ".into(),
                    },
                    Fragment::ParamTuple,
                ],
                params: vec![Param::Literal {
                    value: Value::List((1..=7).map(Value::Int).collect()),
                }],
                placeholder: PlaceholderFormat::default(),
                chunkable: true,
            },
            kind: QueryKind::Read,
        }),
    ));
    let records = interpreter
        .execute(&plan, None, &CancellationToken::new())
        .await
        .unwrap()
        .into_records()
        .unwrap();

    assert_eq!(ids_of(&records, "id"), (1..=7).map(Value::Int).collect::<Vec<_>>());
    let statements = mock.statements("query");
    assert_eq!(statements.len(), 3);
    assert!(statements[0].ends_with("IN (?,?,?)"));
    assert!(statements[2].ends_with("IN (?)"));
}

#[tokio::test]
async fn test_statements_reuse_caller_transaction() {
    let mock = MockDriverAdapter::new();
    let interpreter = interpreter(&mock, ResourceLimits::default());
    let manager = interpreter.transactions().clone();

    let id = manager.start(None).await.unwrap();
    let plan = QueryPlan::new(PlanNode::new(
        "boundary",
        PlanNodeKind::TransactionBoundary(TransactionBoundaryNode {
            isolation_level: None,
            body: Box::new(write("insert", "INSERT INTO users (id) VALUES (1)")),
        }),
    ));
    let output = interpreter
        .execute(&plan, Some(id), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(output, Output::Affected(1));
    assert!(mock.committed_writes().is_empty());
    assert_eq!(manager.state(id), Some(TransactionState::Active));
    assert_eq!(mock.statements("begin").len(), 1);

    manager.commit(id).await.unwrap();
    assert_eq!(mock.committed_writes().len(), 1);
}

#[tokio::test]
async fn test_required_on_empty_result_is_record_not_found() {
    let mock = MockDriverAdapter::new();
    let interpreter = interpreter(&mock, ResourceLimits::default());
    let plan = QueryPlan::new(PlanNode::new(
        "required",
        PlanNodeKind::MapResult(MapResultNode {
            input: Box::new(read("user", "SELECT id FROM users WHERE id = 42")),
            ops: vec![MapOp::Required { message: None }],
        }),
    ));
    let err = interpreter
        .execute(&plan, None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::RecordNotFound);
}

#[tokio::test]
async fn test_response_over_limit_is_rejected() {
    let mock = MockDriverAdapter::new();
    mock.on_query("FROM users", users(&(1..=50).map(Some).collect::<Vec<_>>()));
    let interpreter = interpreter(
        &mock,
        ResourceLimits {
            max_response_size: 256,
            ..ResourceLimits::default()
        },
    );
    let err = interpreter
        .execute(
            &QueryPlan::new(read("users", "SELECT id, name FROM users")),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ResponseTooLarge);
}

#[tokio::test(start_paused = true)]
async fn test_slow_statement_times_out() {
    let mock = MockDriverAdapter::with_config(MockConfig {
        latency: Duration::from_secs(5),
        ..MockConfig::default()
    });
    let interpreter = interpreter(
        &mock,
        ResourceLimits {
            query_timeout: Duration::from_secs(1),
            ..ResourceLimits::default()
        },
    );
    let err = interpreter
        .execute(
            &QueryPlan::new(read("users", "SELECT id FROM users")),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::SocketTimeout);
}

#[tokio::test]
async fn test_cancelled_request_runs_nothing() {
    let mock = MockDriverAdapter::new();
    let interpreter = interpreter(&mock, ResourceLimits::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = interpreter
        .execute(&QueryPlan::new(read("users", "SELECT id FROM users")), None, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);
    assert!(mock.statements("query").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_independent_requests_run_concurrently() {
    let mock = MockDriverAdapter::with_config(MockConfig {
        latency: Duration::from_millis(100),
        ..MockConfig::default()
    });
    let interpreter = interpreter(&mock, ResourceLimits::default());
    let plan = QueryPlan::new(read("users", "SELECT id FROM users"));
    let cancel = CancellationToken::new();

    let started = tokio::time::Instant::now();
    let (first, second) = tokio::join!(
        interpreter.execute(&plan, None, &cancel),
        interpreter.execute(&plan, None, &cancel),
    );
    first.unwrap();
    second.unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[tokio::test]
async fn test_independent_batch_skips_children_of_failed_siblings() {
    let mock = MockDriverAdapter::new();
    mock.fail_on(
        "FROM widgets",
        DriverError::Sqlite {
            extended_code: 1,
            message: "no such table: widgets".to_string(),
        },
    );
    mock.on_query("FROM users", users(&[Some(1)]));
    let interpreter = interpreter(&mock, ResourceLimits::default());

    let plan = QueryPlan::new(batch(
        "batch",
        BatchMode::Independent,
        vec![
            read("widgets", "SELECT id FROM widgets"),
            statement(
                "gadgets",
                "SELECT * FROM gadgets WHERE widget_id = ?",
                vec![reference("widgets", "id", Arity::Scalar)],
                QueryKind::Read,
            ),
            read("users", "SELECT id, name FROM users"),
        ],
    ));
    let Output::Batch(outcomes) = interpreter
        .execute(&plan, None, &CancellationToken::new())
        .await
        .unwrap()
    else {
        panic!("expected batch output");
    };

    assert_eq!(outcomes.len(), 3);
    assert!(
        matches!(&outcomes[0], BatchOutcome::Error(e) if e.kind == ErrorKind::TableDoesNotExist)
    );
    assert_eq!(outcomes[1], BatchOutcome::Skipped);
    assert!(matches!(&outcomes[2], BatchOutcome::Data(Output::Records(rows)) if rows.len() == 1));
    assert!(mock
        .call_history()
        .iter()
        .all(|call| !call.sql.contains("gadgets")));
}

#[tokio::test]
async fn test_last_insert_id_flows_through_wrappers_into_later_statements() {
    let mock = MockDriverAdapter::new();
    mock.on_query(
        "INSERT INTO posts",
        ResultSet {
            last_insert_id: Some("42".to_string()),
            ..ResultSet::default()
        },
    );
    let interpreter = interpreter(&mock, ResourceLimits::default());

    let insert = read("insert", "INSERT INTO posts (title) VALUES ('hello')");
    let plan = QueryPlan::new(batch(
        "batch",
        BatchMode::Transactional,
        vec![
            PlanNode::new(
                "created",
                PlanNodeKind::MapResult(MapResultNode {
                    input: Box::new(insert),
                    ops: vec![MapOp::Unique],
                }),
            ),
            statement(
                "tag",
                "INSERT INTO tags (post_id) VALUES (?)",
                vec![Param::LastInsertId {
                    node: NodeId::from("created"),
                }],
                QueryKind::Write,
            ),
        ],
    ));
    interpreter
        .execute(&plan, None, &CancellationToken::new())
        .await
        .unwrap();

    let tag = mock
        .call_history()
        .into_iter()
        .find(|call| call.sql.contains("INSERT INTO tags"))
        .unwrap();
    assert_eq!(tag.args, vec![Value::Int(42)]);
}

#[tokio::test]
async fn test_unique_with_many_rows_fails_the_request() {
    let mock = MockDriverAdapter::new();
    mock.on_query("FROM users", users(&[Some(1), Some(2)]));
    let interpreter = interpreter(&mock, ResourceLimits::default());
    let plan = QueryPlan::new(PlanNode::new(
        "user",
        PlanNodeKind::MapResult(MapResultNode {
            input: Box::new(read("users", "SELECT id, name FROM users")),
            ops: vec![MapOp::Unique],
        }),
    ));
    let err = interpreter
        .execute(&plan, None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.message, "Expected zero or one element, got 2");
}
