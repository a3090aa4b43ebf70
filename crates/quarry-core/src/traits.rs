use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CanonicalError, DriverError, DriverResult, EngineResult};
use crate::result_set::ResultSet;
use crate::value::Value;

/// Dialect family of a driver adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Sqlite,
    Postgres,
    Mysql,
}

impl Provider {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
        }
    }

    /// Largest number of bind values one statement may carry.
    #[must_use]
    pub fn default_max_bind_values(&self) -> usize {
        match self {
            Self::Sqlite => 999,
            Self::Postgres => 32_766,
            Self::Mysql => 65_535,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = CanonicalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::Mysql),
            other => Err(CanonicalError::plan(format!("unknown provider `{other}`"))),
        }
    }
}

/// Transaction isolation levels callers may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling used in `SET TRANSACTION ISOLATION LEVEL ...`.
    #[must_use]
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Snapshot => "SNAPSHOT",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for IsolationLevel {
    type Err = CanonicalError;

    /// Accepts both `ReadCommitted` and `READ COMMITTED` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match compact.as_str() {
            "readuncommitted" => Ok(Self::ReadUncommitted),
            "readcommitted" => Ok(Self::ReadCommitted),
            "repeatableread" => Ok(Self::RepeatableRead),
            "snapshot" => Ok(Self::Snapshot),
            "serializable" => Ok(Self::Serializable),
            _ => Err(CanonicalError::conversion(format!(
                "invalid isolation level `{s}`"
            ))),
        }
    }
}

/// A statement ready to be sent to a driver: SQL text plus positional args.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlQuery {
    pub sql: String,
    pub args: Vec<Value>,
}

impl SqlQuery {
    #[must_use]
    pub fn new(sql: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }

    /// Statement without bind values (`COMMIT`, `BEGIN`, ...).
    #[must_use]
    pub fn raw(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }
}

/// How a transaction handle wants to be closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    /// When true the handle's `commit`/`rollback` already talk to the
    /// database; the manager must not issue `COMMIT`/`ROLLBACK` itself.
    pub use_phantom_query: bool,
}

/// Static facts about an adapter's connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub schema_name: Option<String>,
    /// Overrides the provider's default bind-value ceiling.
    pub max_bind_values: Option<usize>,
}

/// Byte budget a driver charges while it reads rows off the wire.
pub trait RowBudget: Send + Sync {
    /// Accounts for one decoded row.
    ///
    /// # Errors
    ///
    /// `ResponseTooLarge` once the budget is exhausted; the driver must
    /// stop reading.
    fn charge_row(&self, row: &[Value]) -> EngineResult<()>;
}

/// Raw statement execution shared by adapters and transaction handles.
#[async_trait]
pub trait Queryable: Send + Sync {
    /// Dialect family, used to pick the error normalizer.
    fn provider(&self) -> Provider;

    /// Human-readable adapter name for logs.
    fn adapter_name(&self) -> &str;

    /// Runs a statement that returns rows.
    async fn query_raw(&self, query: &SqlQuery) -> DriverResult<ResultSet>;

    /// Like [`query_raw`](Self::query_raw), charging every row against
    /// `budget`. Streaming drivers override this to stop reading as soon as
    /// the budget runs out.
    async fn query_raw_within(
        &self,
        query: &SqlQuery,
        budget: &dyn RowBudget,
    ) -> DriverResult<ResultSet> {
        let result = self.query_raw(query).await?;
        for row in &result.rows {
            budget.charge_row(row).map_err(DriverError::Mapped)?;
        }
        Ok(result)
    }

    /// Runs a statement and returns the number of affected rows.
    async fn execute_raw(&self, query: &SqlQuery) -> DriverResult<u64>;
}

/// Exclusive handle to one open transaction and its connection.
///
/// Dropping a handle without `commit` or `rollback` must release the
/// connection and discard the transaction's effects.
#[async_trait]
pub trait Transaction: Queryable {
    fn options(&self) -> TransactionOptions;

    /// Makes the transaction's effects durable and releases the connection.
    async fn commit(&mut self) -> DriverResult<()>;

    /// Discards the transaction's effects and releases the connection.
    async fn rollback(&mut self) -> DriverResult<()>;
}

/// Capability interface every concrete database binding implements.
#[async_trait]
pub trait DriverAdapter: Queryable {
    /// Runs a multi-statement script, typically migrations or fixtures.
    async fn execute_script(&self, script: &str) -> DriverResult<()>;

    /// Checks out a connection and opens a transaction on it.
    ///
    /// An isolation level the dialect cannot honour fails with a
    /// `ConversionError`; it is never silently downgraded.
    async fn transaction_context(
        &self,
        isolation_level: Option<IsolationLevel>,
    ) -> DriverResult<Box<dyn Transaction>>;

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo::default()
    }

    /// Closes every pooled connection. Further calls fail.
    async fn dispose(&self) -> DriverResult<()>;
}
