use std::time::Duration;

use quarry_core::{CanonicalError, DriverError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Pool settings for the SQLite adapter.
#[derive(Debug, Clone)]
pub struct SqlitePoolConfig {
    pub max_connections: u32,
    /// How long a caller waits for a free connection before `PoolTimedOut`.
    pub acquire_timeout: Duration,
    /// How long a statement waits on a locked database before `SQLITE_BUSY`.
    pub busy_timeout: Duration,
}

impl Default for SqlitePoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Creates a SQLite connection pool configured for plan execution workloads.
pub async fn create_sqlite_pool(
    database_url: &str,
    config: &SqlitePoolConfig,
) -> Result<SqlitePool, sqlx::Error> {
    let options = database_url
        .parse::<SqliteConnectOptions>()?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(config.busy_timeout)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(options)
        .await
}

/// Converts a sqlx error into the native driver error shape.
///
/// Database errors keep SQLite's extended result code so the SQLite error
/// normalizer can classify them; pool exhaustion is already a timeout.
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> DriverError {
    match err {
        sqlx::Error::Database(db_err) => {
            let extended_code = db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .unwrap_or(1);
            DriverError::Sqlite {
                extended_code,
                message: db_err.message().to_string(),
            }
        }
        sqlx::Error::PoolTimedOut => DriverError::Mapped(CanonicalError::socket_timeout(
            "Timed out fetching a new connection from the connection pool",
        )),
        sqlx::Error::ColumnDecode { index, source } => DriverError::Mapped(
            CanonicalError::conversion(format!("could not decode column {index}: {source}")),
        ),
        other => DriverError::other(other.to_string()),
    }
}
