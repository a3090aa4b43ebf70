//! In-memory scripted driver adapter for testing
//!
//! Simulates a pooled database connection with configurable responses and
//! failure patterns, so the interpreter, transaction manager and governor
//! can be exercised without a real database.
//!
//! # Features
//!
//! - **Scripted Responses**: rows, affected counts or native errors keyed by SQL substring
//! - **Deterministic Failures**: a queue of failures consumed one call at a time
//! - **Call History**: every statement, begin, commit and rollback is recorded
//! - **Latency Simulation**: per-call and per-response delays
//! - **Pool Simulation**: a bounded number of connections; transactions hold one until closed
//! - **Write Log**: writes become visible only once committed, so rollback is observable
//!
//! # Examples
//!
//! ```rust
//! use quarry_core::{ColumnType, DriverAdapter, Queryable, ResultSet, SqlQuery, Value};
//! use quarry_driver::mock::MockDriverAdapter;
//!
//! # async fn example() -> quarry_core::DriverResult<()> {
//! let mock = MockDriverAdapter::new();
//! mock.on_query(
//!     "FROM users",
//!     ResultSet::new(vec![("id".into(), ColumnType::Int64)]).with_row(vec![Value::Int(1)]),
//! );
//!
//! let rows = mock.query_raw(&SqlQuery::raw("SELECT id FROM users")).await?;
//! assert_eq!(rows.len(), 1);
//! assert_eq!(mock.call_history().len(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use quarry_core::{
    CanonicalError, ConnectionInfo, DriverAdapter, DriverError, DriverResult, IsolationLevel,
    Provider, Queryable, ResultSet, SqlQuery, Transaction, TransactionOptions,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Outcome a scripted response produces.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Rows(ResultSet),
    Affected(u64),
    Fail(DriverError),
}

/// Entry of the deterministic failure queue.
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// The call fails with this native error.
    Fail(DriverError),
    /// The call proceeds normally.
    Ok,
}

type Handler = dyn Fn(&SqlQuery) -> Option<MockResponse> + Send + Sync;

enum Responder {
    Needle {
        needle: String,
        delay: Duration,
        response: MockResponse,
    },
    Handler(Box<Handler>),
}

/// Mock adapter configuration.
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub provider: Provider,

    /// Simulated latency of every statement.
    pub latency: Duration,

    /// Time needed to open a transaction once a connection is available.
    pub begin_latency: Duration,

    /// Number of pooled connections.
    pub pool_size: usize,

    /// Isolation levels accepted by `transaction_context`; `None` accepts all.
    pub supported_isolation_levels: Option<Vec<IsolationLevel>>,

    /// Whether transaction handles close themselves (no explicit `COMMIT`).
    pub use_phantom_query: bool,

    pub max_bind_values: Option<usize>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Sqlite,
            latency: Duration::ZERO,
            begin_latency: Duration::ZERO,
            pool_size: 4,
            supported_isolation_levels: None,
            use_phantom_query: false,
            max_bind_values: None,
        }
    }
}

/// Recorded adapter call.
#[derive(Debug, Clone)]
pub struct MockCall {
    /// `query`, `execute`, `script`, `begin`, `commit` or `rollback`.
    pub operation: &'static str,
    pub sql: String,
    pub args: Vec<quarry_core::Value>,
    /// Sequence number of the transaction the call ran in, if any.
    pub transaction: Option<u64>,
    pub success: bool,
    pub timestamp: Instant,
}

struct MockState {
    config: MockConfig,
    responders: RwLock<Vec<Responder>>,
    failure_queue: Mutex<VecDeque<MockFailure>>,
    call_history: Mutex<Vec<MockCall>>,
    committed_writes: Mutex<Vec<SqlQuery>>,
    pool: Arc<Semaphore>,
    open_transactions: AtomicUsize,
    transaction_seq: AtomicU64,
    disposed: AtomicBool,
}

/// Scripted in-memory [`DriverAdapter`].
///
/// Cloning shares the underlying state, so a test can keep a handle for
/// assertions while the engine owns another.
#[derive(Clone)]
pub struct MockDriverAdapter {
    state: Arc<MockState>,
}

impl Default for MockDriverAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriverAdapter {
    /// Create a mock with default config (SQLite provider, no latency).
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::default())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        let pool = Arc::new(Semaphore::new(config.pool_size.max(1)));
        Self {
            state: Arc::new(MockState {
                config,
                responders: RwLock::new(Vec::new()),
                failure_queue: Mutex::new(VecDeque::new()),
                call_history: Mutex::new(Vec::new()),
                committed_writes: Mutex::new(Vec::new()),
                pool,
                open_transactions: AtomicUsize::new(0),
                transaction_seq: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a mock whose calls consume `pattern` in order before succeeding.
    #[must_use]
    pub fn with_failures(pattern: Vec<MockFailure>) -> Self {
        let mock = Self::new();
        mock.state.failure_queue.lock().extend(pattern);
        mock
    }

    /// Rows returned for any statement whose SQL contains `needle`.
    pub fn on_query(&self, needle: &str, rows: ResultSet) {
        self.respond(needle, Duration::ZERO, MockResponse::Rows(rows));
    }

    /// Affected-row count for any statement whose SQL contains `needle`.
    pub fn on_execute(&self, needle: &str, affected: u64) {
        self.respond(needle, Duration::ZERO, MockResponse::Affected(affected));
    }

    /// Native error raised by any statement whose SQL contains `needle`.
    pub fn fail_on(&self, needle: &str, error: DriverError) {
        self.respond(needle, Duration::ZERO, MockResponse::Fail(error));
    }

    /// Scripted response delivered after `delay`.
    pub fn respond(&self, needle: &str, delay: Duration, response: MockResponse) {
        self.state.responders.write().push(Responder::Needle {
            needle: needle.to_string(),
            delay,
            response,
        });
    }

    /// Computes responses from the statement itself, e.g. rows per bound key.
    pub fn on_statement<F>(&self, handler: F)
    where
        F: Fn(&SqlQuery) -> Option<MockResponse> + Send + Sync + 'static,
    {
        self.state
            .responders
            .write()
            .push(Responder::Handler(Box::new(handler)));
    }

    /// Appends entries to the failure queue.
    pub fn push_failures(&self, pattern: impl IntoIterator<Item = MockFailure>) {
        self.state.failure_queue.lock().extend(pattern);
    }

    #[must_use]
    pub fn call_history(&self) -> Vec<MockCall> {
        self.state.call_history.lock().clone()
    }

    /// SQL of every recorded call with the given operation.
    #[must_use]
    pub fn statements(&self, operation: &str) -> Vec<String> {
        self.state
            .call_history
            .lock()
            .iter()
            .filter(|call| call.operation == operation)
            .map(|call| call.sql.clone())
            .collect()
    }

    /// Writes that are durable: executed outside a transaction or committed.
    #[must_use]
    pub fn committed_writes(&self) -> Vec<SqlQuery> {
        self.state.committed_writes.lock().clone()
    }

    /// Transaction handles that are neither committed, rolled back nor dropped.
    #[must_use]
    pub fn open_transactions(&self) -> usize {
        self.state.open_transactions.load(Ordering::SeqCst)
    }

    /// Connections currently free in the pool.
    #[must_use]
    pub fn available_connections(&self) -> usize {
        self.state.pool.available_permits()
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::SeqCst)
    }
}

impl MockState {
    fn record(
        &self,
        operation: &'static str,
        query: &SqlQuery,
        transaction: Option<u64>,
        success: bool,
    ) {
        self.call_history.lock().push(MockCall {
            operation,
            sql: query.sql.clone(),
            args: query.args.clone(),
            transaction,
            success,
            timestamp: Instant::now(),
        });
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(DriverError::other("adapter has been disposed"));
        }
        Ok(())
    }

    fn next_failure(&self) -> Option<DriverError> {
        match self.failure_queue.lock().pop_front() {
            Some(MockFailure::Fail(error)) => Some(error),
            Some(MockFailure::Ok) | None => None,
        }
    }

    fn lookup(&self, query: &SqlQuery) -> (Duration, Option<MockResponse>) {
        for responder in self.responders.read().iter() {
            match responder {
                Responder::Needle {
                    needle,
                    delay,
                    response,
                } if query.sql.contains(needle.as_str()) => {
                    return (*delay, Some(response.clone()));
                }
                Responder::Handler(handler) => {
                    if let Some(response) = handler(query) {
                        return (Duration::ZERO, Some(response));
                    }
                }
                Responder::Needle { .. } => {}
            }
        }
        (Duration::ZERO, None)
    }

    /// Runs one statement; writes go to `buffer` when inside a transaction.
    async fn run(
        &self,
        operation: &'static str,
        query: &SqlQuery,
        transaction: Option<(u64, &Mutex<Vec<SqlQuery>>)>,
    ) -> DriverResult<MockResponse> {
        self.ensure_open()?;
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
        let tx_seq = transaction.map(|(seq, _)| seq);

        if let Some(error) = self.next_failure() {
            self.record(operation, query, tx_seq, false);
            return Err(error);
        }

        let (delay, response) = self.lookup(query);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let response = match response {
            Some(MockResponse::Fail(error)) => {
                self.record(operation, query, tx_seq, false);
                return Err(error);
            }
            Some(response) => response,
            None if operation == "execute" => MockResponse::Affected(1),
            None => MockResponse::Rows(ResultSet::default()),
        };

        if operation == "execute" && !is_control_statement(&query.sql) {
            match transaction {
                Some((_, buffer)) => buffer.lock().push(query.clone()),
                None => self.committed_writes.lock().push(query.clone()),
            }
        }
        self.record(operation, query, tx_seq, true);
        Ok(response)
    }
}

fn is_control_statement(sql: &str) -> bool {
    let head = sql.trim_start().to_ascii_uppercase();
    ["BEGIN", "COMMIT", "ROLLBACK", "SET TRANSACTION"]
        .iter()
        .any(|keyword| head.starts_with(keyword))
}

fn expect_rows(response: MockResponse) -> DriverResult<ResultSet> {
    match response {
        MockResponse::Rows(rows) => Ok(rows),
        MockResponse::Affected(_) => Ok(ResultSet::default()),
        MockResponse::Fail(error) => Err(error),
    }
}

fn expect_affected(response: MockResponse) -> DriverResult<u64> {
    match response {
        MockResponse::Affected(count) => Ok(count),
        MockResponse::Rows(rows) => Ok(rows.len() as u64),
        MockResponse::Fail(error) => Err(error),
    }
}

#[async_trait]
impl Queryable for MockDriverAdapter {
    fn provider(&self) -> Provider {
        self.state.config.provider
    }

    fn adapter_name(&self) -> &str {
        "mock"
    }

    async fn query_raw(&self, query: &SqlQuery) -> DriverResult<ResultSet> {
        let _connection = self.acquire().await?;
        expect_rows(self.state.run("query", query, None).await?)
    }

    async fn execute_raw(&self, query: &SqlQuery) -> DriverResult<u64> {
        let _connection = self.acquire().await?;
        expect_affected(self.state.run("execute", query, None).await?)
    }
}

impl MockDriverAdapter {
    async fn acquire(&self) -> DriverResult<OwnedSemaphorePermit> {
        Arc::clone(&self.state.pool)
            .acquire_owned()
            .await
            .map_err(|_| DriverError::other("connection pool is closed"))
    }
}

#[async_trait]
impl DriverAdapter for MockDriverAdapter {
    async fn execute_script(&self, script: &str) -> DriverResult<()> {
        self.state.ensure_open()?;
        let query = SqlQuery::raw(script);
        if let Some(error) = self.state.next_failure() {
            self.state.record("script", &query, None, false);
            return Err(error);
        }
        self.state.record("script", &query, None, true);
        Ok(())
    }

    async fn transaction_context(
        &self,
        isolation_level: Option<IsolationLevel>,
    ) -> DriverResult<Box<dyn Transaction>> {
        self.state.ensure_open()?;
        if let (Some(level), Some(supported)) =
            (isolation_level, &self.state.config.supported_isolation_levels)
        {
            if !supported.contains(&level) {
                return Err(DriverError::Mapped(CanonicalError::conversion(format!(
                    "Invalid isolation level `{level}`"
                ))));
            }
        }

        let permit = self.acquire().await?;
        if !self.state.config.begin_latency.is_zero() {
            tokio::time::sleep(self.state.config.begin_latency).await;
        }

        let seq = self.state.transaction_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let begin = SqlQuery::raw(match isolation_level {
            Some(level) => format!("BEGIN ISOLATION LEVEL {level}"),
            None => "BEGIN".to_string(),
        });
        if let Some(error) = self.state.next_failure() {
            self.state.record("begin", &begin, Some(seq), false);
            return Err(error);
        }
        self.state.record("begin", &begin, Some(seq), true);
        self.state.open_transactions.fetch_add(1, Ordering::SeqCst);
        debug!(transaction = seq, "Mock transaction opened");

        Ok(Box::new(MockTransaction {
            state: Arc::clone(&self.state),
            seq,
            buffer: Mutex::new(Vec::new()),
            permit: Some(permit),
        }))
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            schema_name: None,
            max_bind_values: self.state.config.max_bind_values,
        }
    }

    async fn dispose(&self) -> DriverResult<()> {
        self.state.disposed.store(true, Ordering::SeqCst);
        self.state.pool.close();
        Ok(())
    }
}

/// Transaction handle of the mock; holds a pool permit until closed.
struct MockTransaction {
    state: Arc<MockState>,
    seq: u64,
    buffer: Mutex<Vec<SqlQuery>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl MockTransaction {
    fn ensure_active(&self) -> DriverResult<()> {
        if self.permit.is_none() {
            return Err(DriverError::other("transaction is already closed"));
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.permit.take().is_some() {
            self.state.open_transactions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Queryable for MockTransaction {
    fn provider(&self) -> Provider {
        self.state.config.provider
    }

    fn adapter_name(&self) -> &str {
        "mock"
    }

    async fn query_raw(&self, query: &SqlQuery) -> DriverResult<ResultSet> {
        self.ensure_active()?;
        expect_rows(
            self.state
                .run("query", query, Some((self.seq, &self.buffer)))
                .await?,
        )
    }

    async fn execute_raw(&self, query: &SqlQuery) -> DriverResult<u64> {
        self.ensure_active()?;
        expect_affected(
            self.state
                .run("execute", query, Some((self.seq, &self.buffer)))
                .await?,
        )
    }
}

#[async_trait]
impl Transaction for MockTransaction {
    fn options(&self) -> TransactionOptions {
        TransactionOptions {
            use_phantom_query: self.state.config.use_phantom_query,
        }
    }

    async fn commit(&mut self) -> DriverResult<()> {
        self.ensure_active()?;
        let query = SqlQuery::raw("COMMIT");
        if let Some(error) = self.state.next_failure() {
            self.state.record("commit", &query, Some(self.seq), false);
            return Err(error);
        }
        let writes = std::mem::take(&mut *self.buffer.lock());
        self.state.committed_writes.lock().extend(writes);
        self.state.record("commit", &query, Some(self.seq), true);
        self.close();
        Ok(())
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.ensure_active()?;
        self.buffer.lock().clear();
        self.state
            .record("rollback", &SqlQuery::raw("ROLLBACK"), Some(self.seq), true);
        self.close();
        Ok(())
    }
}

impl Drop for MockTransaction {
    fn drop(&mut self) {
        self.close();
    }
}
