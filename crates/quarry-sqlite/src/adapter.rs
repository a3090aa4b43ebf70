use async_trait::async_trait;
use quarry_core::{
    CanonicalError, DriverAdapter, DriverError, DriverResult, IsolationLevel, Provider,
    Queryable, ResultSet, RowBudget, SqlQuery, Transaction, TransactionOptions,
};
use sqlx::{Executor, Sqlite, SqlitePool, Statement};
use tokio::sync::Mutex;
use tracing::debug;

use crate::codec::{bind_all, drain};
use crate::util::map_sqlx_error;

/// SQLite-backed driver adapter.
///
/// Plain statements run on any pooled connection; each transaction checks
/// out one connection and keeps it until commit, rollback or drop.
pub struct SqliteAdapter {
    pool: SqlitePool,
}

impl SqliteAdapter {
    /// Creates a new adapter backed by the provided pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Provides access to the underlying pool, primarily for testing.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch(&self, query: &SqlQuery, budget: Option<&dyn RowBudget>) -> DriverResult<ResultSet> {
        debug!(sql = %query.sql, args = query.args.len(), "query_raw");
        let stream = bind_all(&query.sql, &query.args).fetch_many(&self.pool);
        let fetched = drain(stream, &query.sql, budget).await?;
        if fetched.is_empty() {
            let statement = (&self.pool)
                .prepare(query.sql.as_str())
                .await
                .map_err(map_sqlx_error)?;
            return Ok(fetched.into_result_set(statement.columns()));
        }
        Ok(fetched.into_result_set(&[]))
    }
}

#[async_trait]
impl Queryable for SqliteAdapter {
    fn provider(&self) -> Provider {
        Provider::Sqlite
    }

    fn adapter_name(&self) -> &str {
        "sqlx-sqlite"
    }

    async fn query_raw(&self, query: &SqlQuery) -> DriverResult<ResultSet> {
        self.fetch(query, None).await
    }

    async fn query_raw_within(
        &self,
        query: &SqlQuery,
        budget: &dyn RowBudget,
    ) -> DriverResult<ResultSet> {
        self.fetch(query, Some(budget)).await
    }

    async fn execute_raw(&self, query: &SqlQuery) -> DriverResult<u64> {
        debug!(sql = %query.sql, args = query.args.len(), "execute_raw");
        bind_all(&query.sql, &query.args)
            .execute(&self.pool)
            .await
            .map(|result| result.rows_affected())
            .map_err(map_sqlx_error)
    }
}

#[async_trait]
impl DriverAdapter for SqliteAdapter {
    async fn execute_script(&self, script: &str) -> DriverResult<()> {
        (&self.pool)
            .execute(script)
            .await
            .map(|_| ())
            .map_err(map_sqlx_error)
    }

    async fn transaction_context(
        &self,
        isolation_level: Option<IsolationLevel>,
    ) -> DriverResult<Box<dyn Transaction>> {
        if let Some(level) = isolation_level {
            if level != IsolationLevel::Serializable {
                return Err(DriverError::Mapped(CanonicalError::conversion(format!(
                    "Invalid isolation level `{level}`: SQLite only supports SERIALIZABLE"
                ))));
            }
        }
        let tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        debug!("Opened SQLite transaction");
        Ok(Box::new(SqliteTransaction {
            inner: Mutex::new(Some(tx)),
        }))
    }

    async fn dispose(&self) -> DriverResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// Open SQLite transaction; dropping it rolls back.
struct SqliteTransaction {
    inner: Mutex<Option<sqlx::Transaction<'static, Sqlite>>>,
}

impl SqliteTransaction {
    async fn fetch(&self, query: &SqlQuery, budget: Option<&dyn RowBudget>) -> DriverResult<ResultSet> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or_else(closed)?;
        let stream = bind_all(&query.sql, &query.args).fetch_many(&mut **tx);
        let fetched = drain(stream, &query.sql, budget).await?;
        if fetched.is_empty() {
            let statement = (&mut **tx)
                .prepare(query.sql.as_str())
                .await
                .map_err(map_sqlx_error)?;
            return Ok(fetched.into_result_set(statement.columns()));
        }
        Ok(fetched.into_result_set(&[]))
    }
}

fn closed() -> DriverError {
    DriverError::Mapped(CanonicalError::transaction_closed(
        "Transaction is no longer valid",
    ))
}

#[async_trait]
impl Queryable for SqliteTransaction {
    fn provider(&self) -> Provider {
        Provider::Sqlite
    }

    fn adapter_name(&self) -> &str {
        "sqlx-sqlite"
    }

    async fn query_raw(&self, query: &SqlQuery) -> DriverResult<ResultSet> {
        self.fetch(query, None).await
    }

    async fn query_raw_within(
        &self,
        query: &SqlQuery,
        budget: &dyn RowBudget,
    ) -> DriverResult<ResultSet> {
        self.fetch(query, Some(budget)).await
    }

    async fn execute_raw(&self, query: &SqlQuery) -> DriverResult<u64> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or_else(closed)?;
        bind_all(&query.sql, &query.args)
            .execute(&mut **tx)
            .await
            .map(|result| result.rows_affected())
            .map_err(map_sqlx_error)
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    fn options(&self) -> TransactionOptions {
        // sqlx issues COMMIT/ROLLBACK itself.
        TransactionOptions {
            use_phantom_query: true,
        }
    }

    async fn commit(&mut self) -> DriverResult<()> {
        let tx = self.inner.get_mut().take().ok_or_else(closed)?;
        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        let tx = self.inner.get_mut().take().ok_or_else(closed)?;
        tx.rollback().await.map_err(map_sqlx_error)
    }
}
