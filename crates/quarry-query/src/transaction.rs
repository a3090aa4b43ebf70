//! Transaction manager
//!
//! Tracks every transaction opened through the engine, from the moment a
//! connection is requested until commit, rollback or expiry:
//!
//! ```text
//! Starting -> Active -> Committing  -> Committed
//!                    -> RollingBack -> RolledBack | TimedOut
//! ```
//!
//! A transaction owns one connection exclusively. Operations against the
//! same transaction queue on an async mutex and run one at a time; separate
//! transactions never wait on each other.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use quarry_core::metrics::{ACTIVE_TRANSACTIONS, TRANSACTIONS};
use quarry_core::{
    CanonicalError, DriverAdapter, DriverError, DriverResult, EngineResult, IsolationLevel,
    Provider, ResourceLimits, ResultSet, RowBudget, SqlQuery, Transaction, TransactionId,
};
use quarry_driver::NormalizerRegistry;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Number of closed transactions remembered for error reporting.
const CLOSED_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Starting,
    Active,
    Committing,
    RollingBack,
    Committed,
    RolledBack,
    TimedOut,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Committing => "committing",
            Self::RollingBack => "rolling_back",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::TimedOut)
    }
}

type Handle = Arc<AsyncMutex<Option<Box<dyn Transaction>>>>;

struct Entry {
    state: Mutex<TransactionState>,
    handle: Handle,
    /// Fires when the transaction is being closed; interrupts in-flight
    /// and queued operations.
    closing: CancellationToken,
    /// Fires when `max_transaction_timeout` elapses; preempts a commit or
    /// rollback still waiting for the connection.
    expiring: CancellationToken,
    expired: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    opened_at: Instant,
}

struct ClosedTransaction {
    id: TransactionId,
    state: TransactionState,
    lifetime: Duration,
}

struct Inner {
    adapter: Arc<dyn DriverAdapter>,
    registry: NormalizerRegistry,
    limits: ResourceLimits,
    active: Mutex<HashMap<TransactionId, Arc<Entry>>>,
    closed: Mutex<VecDeque<ClosedTransaction>>,
}

#[derive(Debug, Clone, Copy)]
enum Close {
    Commit,
    Rollback,
    /// `max_transaction_timeout` elapsed.
    Expire,
    /// Caller cancellation or shutdown.
    Abort,
}

impl Close {
    fn operation(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Rollback | Self::Expire | Self::Abort => "rollback",
        }
    }

    /// Whether in-flight work is interrupted instead of awaited.
    fn interrupts(&self) -> bool {
        matches!(self, Self::Expire | Self::Abort)
    }
}

/// Manager of interactive transactions for one driver adapter.
///
/// Cheap to clone; clones share the same transaction table.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<Inner>,
}

impl TransactionManager {
    pub fn new(
        adapter: Arc<dyn DriverAdapter>,
        registry: NormalizerRegistry,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                adapter,
                registry,
                limits,
                active: Mutex::new(HashMap::new()),
                closed: Mutex::new(VecDeque::with_capacity(CLOSED_HISTORY)),
            }),
        }
    }

    pub fn provider(&self) -> Provider {
        self.inner.adapter.provider()
    }

    /// Opens a transaction and returns its id.
    ///
    /// Waiting for a connection is bounded by `max_transaction_wait_time`.
    /// A context the adapter produces after that deadline is rolled back in
    /// the background so its connection returns to the pool.
    ///
    /// # Errors
    ///
    /// `SocketTimeout` when no connection was obtained in time; the
    /// normalized driver error when the adapter refuses (including
    /// `ConversionError` for an unsupported isolation level).
    pub async fn start(&self, isolation_level: Option<IsolationLevel>) -> EngineResult<TransactionId> {
        let id = TransactionId::new();
        let entry = Arc::new(Entry {
            state: Mutex::new(TransactionState::Starting),
            handle: Arc::new(AsyncMutex::new(None)),
            closing: CancellationToken::new(),
            expiring: CancellationToken::new(),
            expired: AtomicBool::new(false),
            timer: Mutex::new(None),
            opened_at: Instant::now(),
        });
        self.inner.active.lock().insert(id, Arc::clone(&entry));

        let adapter = Arc::clone(&self.inner.adapter);
        let mut opening =
            tokio::spawn(async move { adapter.transaction_context(isolation_level).await });
        let wait = self.inner.limits.max_transaction_wait_time;

        let waited = tokio::time::timeout(wait, &mut opening).await;
        let opened = match waited {
            Ok(Ok(opened)) => opened,
            Ok(Err(join_error)) => Err(DriverError::other(format!(
                "transaction start task failed: {join_error}"
            ))),
            Err(_) => {
                tokio::spawn(async move {
                    if let Ok(Ok(mut late)) = opening.await {
                        if let Err(error) = late.rollback().await {
                            warn!(error = %error, "Failed to roll back late transaction");
                        }
                    }
                });
                self.inner.active.lock().remove(&id);
                *entry.state.lock() = TransactionState::RolledBack;
                self.remember(id, TransactionState::RolledBack, entry.opened_at.elapsed());
                TRANSACTIONS.with_label_values(&["start_timeout"]).inc();
                warn!(
                    transaction_id = %id,
                    wait_ms = wait.as_millis() as u64,
                    "Timed out waiting for a transaction connection"
                );
                return Err(CanonicalError::socket_timeout(format!(
                    "Unable to start a transaction in the given time ({} ms)",
                    wait.as_millis()
                )));
            }
        };

        let transaction = match opened {
            Ok(transaction) => transaction,
            Err(error) => {
                self.inner.active.lock().remove(&id);
                return Err(self.normalize(&error));
            }
        };

        *entry.handle.lock().await = Some(transaction);
        *entry.state.lock() = TransactionState::Active;
        ACTIVE_TRANSACTIONS.inc();

        let timeout = self.inner.limits.max_transaction_timeout;
        let manager = Arc::downgrade(&self.inner);
        let expiring = entry.expiring.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expiring.cancel();
            if let Some(inner) = manager.upgrade() {
                let manager = TransactionManager { inner };
                if let Err(error) = manager.close(id, Close::Expire).await {
                    debug!(transaction_id = %id, error = %error, "Expiry found transaction already closed");
                }
            }
        });
        *entry.timer.lock() = Some(timer);

        info!(
            transaction_id = %id,
            isolation_level = ?isolation_level,
            "Transaction started"
        );
        Ok(id)
    }

    /// Commits the transaction, waiting for queued operations first.
    ///
    /// # Errors
    ///
    /// `TransactionNotFound` / `TransactionClosed` for unknown or closed
    /// ids; the normalized driver error when the commit fails, in which
    /// case the transaction has been rolled back.
    pub async fn commit(&self, id: TransactionId) -> EngineResult<()> {
        self.close(id, Close::Commit).await
    }

    /// Rolls the transaction back, waiting for queued operations first.
    ///
    /// # Errors
    ///
    /// As [`commit`](Self::commit).
    pub async fn rollback(&self, id: TransactionId) -> EngineResult<()> {
        self.close(id, Close::Rollback).await
    }

    /// Rolls the transaction back without waiting for in-flight work.
    ///
    /// # Errors
    ///
    /// As [`commit`](Self::commit).
    pub async fn abort(&self, id: TransactionId) -> EngineResult<()> {
        self.close(id, Close::Abort).await
    }

    /// Rolls back every open transaction; used on shutdown.
    pub async fn cancel_all(&self) {
        let ids: Vec<TransactionId> = self.inner.active.lock().keys().copied().collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "Rolling back open transactions");
        }
        for id in ids {
            if let Err(error) = self.close(id, Close::Abort).await {
                debug!(transaction_id = %id, error = %error, "Transaction closed before cancel");
            }
        }
    }

    /// Runs a row-returning statement inside the transaction.
    pub async fn query_raw(&self, id: TransactionId, query: &SqlQuery) -> DriverResult<ResultSet> {
        self.fetch(id, query, None).await
    }

    /// Like [`query_raw`](Self::query_raw), charging rows against `budget`
    /// while they are read.
    pub async fn query_raw_within(
        &self,
        id: TransactionId,
        query: &SqlQuery,
        budget: &dyn RowBudget,
    ) -> DriverResult<ResultSet> {
        self.fetch(id, query, Some(budget)).await
    }

    async fn fetch(
        &self,
        id: TransactionId,
        query: &SqlQuery,
        budget: Option<&dyn RowBudget>,
    ) -> DriverResult<ResultSet> {
        let (entry, guard) = self.checkout(id, "query").await?;
        let Some(transaction) = guard.as_deref() else {
            return Err(DriverError::Mapped(self.closed_now(&entry, "query")));
        };
        let call = async {
            match budget {
                Some(budget) => transaction.query_raw_within(query, budget).await,
                None => transaction.query_raw(query).await,
            }
        };
        tokio::select! {
            biased;
            _ = entry.closing.cancelled() => Err(DriverError::Mapped(self.closed_now(&entry, "query"))),
            result = call => result,
        }
    }

    /// Runs a statement inside the transaction and returns affected rows.
    pub async fn execute_raw(&self, id: TransactionId, query: &SqlQuery) -> DriverResult<u64> {
        let (entry, guard) = self.checkout(id, "execute").await?;
        let Some(transaction) = guard.as_deref() else {
            return Err(DriverError::Mapped(self.closed_now(&entry, "execute")));
        };
        tokio::select! {
            biased;
            _ = entry.closing.cancelled() => Err(DriverError::Mapped(self.closed_now(&entry, "execute"))),
            result = transaction.execute_raw(query) => result,
        }
    }

    /// Current state of an open transaction, or final state of a recently
    /// closed one.
    pub fn state(&self, id: TransactionId) -> Option<TransactionState> {
        if let Some(entry) = self.inner.active.lock().get(&id) {
            return Some(*entry.state.lock());
        }
        self.inner
            .closed
            .lock()
            .iter()
            .rev()
            .find(|closed| closed.id == id)
            .map(|closed| closed.state)
    }

    /// Recently closed transactions with their final state, oldest first.
    pub fn history(&self) -> Vec<(TransactionId, TransactionState)> {
        self.inner
            .closed
            .lock()
            .iter()
            .map(|closed| (closed.id, closed.state))
            .collect()
    }

    /// Number of transactions that are starting or open.
    pub fn open_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    fn normalize(&self, error: &DriverError) -> CanonicalError {
        self.inner.registry.normalize(self.provider(), error)
    }

    fn lookup(&self, id: TransactionId, operation: &str) -> EngineResult<Arc<Entry>> {
        if let Some(entry) = self.inner.active.lock().get(&id) {
            return Ok(Arc::clone(entry));
        }
        let closed = self.inner.closed.lock();
        match closed.iter().rev().find(|closed| closed.id == id) {
            Some(closed) => Err(self.closed_error(operation, closed.state, closed.lifetime)),
            None => Err(CanonicalError::transaction_not_found(id)),
        }
    }

    /// Waits for exclusive use of the transaction's connection.
    async fn checkout(
        &self,
        id: TransactionId,
        operation: &str,
    ) -> DriverResult<(Arc<Entry>, OwnedMutexGuard<Option<Box<dyn Transaction>>>)> {
        let entry = self.lookup(id, operation).map_err(DriverError::Mapped)?;
        let guard = tokio::select! {
            biased;
            _ = entry.closing.cancelled() => None,
            guard = Arc::clone(&entry.handle).lock_owned() => Some(guard),
        };
        let active = *entry.state.lock() == TransactionState::Active;
        match guard {
            Some(guard) if active => Ok((entry, guard)),
            _ => Err(DriverError::Mapped(self.closed_now(&entry, operation))),
        }
    }

    async fn close(&self, id: TransactionId, close: Close) -> EngineResult<()> {
        let entry = self.lookup(id, close.operation())?;
        {
            let mut state = entry.state.lock();
            if *state != TransactionState::Active {
                drop(state);
                return Err(self.closed_now(&entry, close.operation()));
            }
            *state = match close {
                Close::Commit => TransactionState::Committing,
                Close::Rollback | Close::Expire | Close::Abort => TransactionState::RollingBack,
            };
        }
        if matches!(close, Close::Expire) {
            entry.expired.store(true, Ordering::SeqCst);
        }
        if close.interrupts() {
            entry.closing.cancel();
        }

        let handle = Arc::clone(&entry.handle);
        let mut guard = if close.interrupts() {
            handle.lock_owned().await
        } else {
            tokio::select! {
                biased;
                _ = entry.expiring.cancelled() => {
                    entry.expired.store(true, Ordering::SeqCst);
                    *entry.state.lock() = TransactionState::RollingBack;
                    entry.closing.cancel();
                    warn!(
                        transaction_id = %id,
                        operation = close.operation(),
                        "Transaction expired while waiting to close"
                    );
                    Arc::clone(&entry.handle).lock_owned().await
                }
                guard = handle.lock_owned() => guard,
            }
        };
        let transaction = guard.take();
        drop(guard);
        entry.closing.cancel();

        let expired = entry.expired.load(Ordering::SeqCst);
        let effective = if expired { Close::Expire } else { close };

        self.inner.active.lock().remove(&id);
        let timer = entry.timer.lock().take();
        if let Some(timer) = timer {
            // The expiry timer is the task running this close.
            if !matches!(close, Close::Expire) {
                timer.abort();
            }
        }
        ACTIVE_TRANSACTIONS.dec();

        let Some(mut transaction) = transaction else {
            return Err(self.closed_now(&entry, close.operation()));
        };

        let (outcome, final_state) = match effective {
            Close::Commit => match commit_handle(&mut *transaction).await {
                Ok(()) => (Ok(()), TransactionState::Committed),
                Err(error) => (Err(error), TransactionState::RolledBack),
            },
            Close::Rollback | Close::Abort => {
                (rollback_handle(&mut *transaction).await, TransactionState::RolledBack)
            }
            Close::Expire => (rollback_handle(&mut *transaction).await, TransactionState::TimedOut),
        };

        let lifetime = entry.opened_at.elapsed();
        *entry.state.lock() = final_state;
        self.remember(id, final_state, lifetime);
        TRANSACTIONS.with_label_values(&[final_state.as_str()]).inc();

        match &outcome {
            Ok(()) => info!(
                transaction_id = %id,
                state = final_state.as_str(),
                duration_ms = lifetime.as_millis() as u64,
                "Transaction closed"
            ),
            Err(error) => warn!(
                transaction_id = %id,
                state = final_state.as_str(),
                error = %error,
                "Transaction closed with driver error"
            ),
        }
        let outcome = outcome.map_err(|error| self.normalize(&error));
        if expired && !matches!(close, Close::Expire) {
            return Err(self.closed_error(close.operation(), TransactionState::TimedOut, lifetime));
        }
        outcome
    }

    fn remember(&self, id: TransactionId, state: TransactionState, lifetime: Duration) {
        let mut closed = self.inner.closed.lock();
        if closed.len() == CLOSED_HISTORY {
            closed.pop_front();
        }
        closed.push_back(ClosedTransaction {
            id,
            state,
            lifetime,
        });
    }

    fn closed_now(&self, entry: &Entry, operation: &str) -> CanonicalError {
        let state = if entry.expired.load(Ordering::SeqCst) {
            TransactionState::TimedOut
        } else {
            *entry.state.lock()
        };
        self.closed_error(operation, state, entry.opened_at.elapsed())
    }

    fn closed_error(
        &self,
        operation: &str,
        state: TransactionState,
        lifetime: Duration,
    ) -> CanonicalError {
        let message = match state {
            TransactionState::TimedOut => format!(
                "Transaction already closed: A {operation} cannot be executed on an expired transaction. \
                 The timeout for this transaction was {} ms, however {} ms passed since the start of the transaction.",
                self.inner.limits.max_transaction_timeout.as_millis(),
                lifetime.as_millis()
            ),
            TransactionState::Committing | TransactionState::Committed => format!(
                "Transaction already closed: A {operation} cannot be executed on a committed transaction."
            ),
            _ => format!(
                "Transaction already closed: A {operation} cannot be executed on a transaction that was rolled back."
            ),
        };
        CanonicalError::transaction_closed(message)
    }
}

/// Issues `COMMIT` unless the handle commits by itself; a failed commit is
/// rolled back before the error is returned.
async fn commit_handle(transaction: &mut dyn Transaction) -> DriverResult<()> {
    if !transaction.options().use_phantom_query {
        if let Err(error) = transaction.execute_raw(&SqlQuery::raw("COMMIT")).await {
            if let Err(rollback_error) = transaction.rollback().await {
                warn!(error = %rollback_error, "Rollback after failed commit also failed");
            }
            return Err(error);
        }
    }
    match transaction.commit().await {
        Ok(()) => Ok(()),
        Err(error) => {
            if let Err(rollback_error) = transaction.rollback().await {
                debug!(error = %rollback_error, "Handle already released after failed commit");
            }
            Err(error)
        }
    }
}

/// Issues `ROLLBACK` unless the handle rolls back by itself. The handle is
/// released even when the statement fails.
async fn rollback_handle(transaction: &mut dyn Transaction) -> DriverResult<()> {
    let statement = if transaction.options().use_phantom_query {
        Ok(0)
    } else {
        transaction.execute_raw(&SqlQuery::raw("ROLLBACK")).await
    };
    let released = transaction.rollback().await;
    statement.and(released)
}
