//! SQLite-family driver adapter for the Quarry engine, backed by sqlx.

mod adapter;
mod codec;
mod util;

pub use adapter::SqliteAdapter;
pub use util::{create_sqlite_pool, SqlitePoolConfig};
