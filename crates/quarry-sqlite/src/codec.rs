//! Conversion between engine values and SQLite storage classes.

use futures::stream::BoxStream;
use futures::TryStreamExt;
use num_traits::ToPrimitive;
use quarry_core::{ColumnType, DriverError, DriverResult, ResultSet, RowBudget, Value};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteColumn, SqliteQueryResult, SqliteRow};
use sqlx::{Column, Either, Row, Sqlite, TypeInfo, ValueRef};

use crate::util::map_sqlx_error;

/// Binds every argument in order. Values SQLite has no storage class for
/// are bound as text, so nothing is rounded on the way in.
pub(crate) fn bind_all<'q>(sql: &'q str, args: &'q [Value]) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    args.iter().fold(sqlx::query(sql), bind_value)
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<i64>),
        Value::Boolean(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::BigInt(big) => match big.to_i64() {
            Some(i) => query.bind(i),
            None => query.bind(big.to_string()),
        },
        Value::Decimal(dec) => query.bind(dec.to_plain_string()),
        Value::Text(s) => query.bind(s.as_str()),
        Value::Bytes(b) => query.bind(b.as_slice()),
        Value::DateTime(dt) => query.bind(dt.to_rfc3339()),
        Value::Date(d) => query.bind(d.format("%Y-%m-%d").to_string()),
        Value::Time(t) => query.bind(t.format("%H:%M:%S%.f").to_string()),
        Value::Uuid(u) => query.bind(u.to_string()),
        Value::Json(json) => query.bind(json.to_string()),
        Value::List(_) | Value::Object(_) => query.bind(value.to_json().to_string()),
    }
}

/// Maps a declared column type to the engine's column type.
fn column_type(declared: &str) -> Option<ColumnType> {
    let upper = declared.to_ascii_uppercase();
    Some(match upper.as_str() {
        "INTEGER" | "INT" | "BIGINT" | "INT8" => ColumnType::Int64,
        "REAL" | "DOUBLE" | "FLOAT" => ColumnType::Double,
        "NUMERIC" | "DECIMAL" => ColumnType::Numeric,
        "BOOLEAN" | "BOOL" => ColumnType::Boolean,
        "DATETIME" | "TIMESTAMP" => ColumnType::DateTime,
        "DATE" => ColumnType::Date,
        "TIME" => ColumnType::Time,
        "BLOB" => ColumnType::Bytes,
        "TEXT" | "VARCHAR" | "CHAR" | "CLOB" => ColumnType::Text,
        "JSON" | "JSONB" => ColumnType::Json,
        _ => return None,
    })
}

/// Column type inferred from a value, for expression columns without a
/// declared type.
fn inferred_type(value: &Value) -> ColumnType {
    match value {
        Value::Int(_) => ColumnType::Int64,
        Value::Float(_) => ColumnType::Double,
        Value::Bytes(_) => ColumnType::Bytes,
        _ => ColumnType::Text,
    }
}

fn decode_cell(row: &SqliteRow, index: usize) -> DriverResult<Value> {
    let storage = {
        let raw = row.try_get_raw(index).map_err(map_sqlx_error)?;
        if raw.is_null() {
            return Ok(Value::Null);
        }
        raw.type_info().name().to_string()
    };
    let decoded = match storage.as_str() {
        "INTEGER" | "BOOLEAN" => row.try_get_unchecked::<i64, _>(index).map(Value::Int),
        "REAL" => row.try_get_unchecked::<f64, _>(index).map(Value::Float),
        "BLOB" => row.try_get_unchecked::<Vec<u8>, _>(index).map(Value::Bytes),
        _ => row.try_get_unchecked::<String, _>(index).map(Value::Text),
    };
    decoded.map_err(map_sqlx_error)
}

type RowStream<'e> = BoxStream<'e, Result<Either<SqliteQueryResult, SqliteRow>, sqlx::Error>>;

/// Rows decoded from a statement, before column types are settled.
pub(crate) struct Fetched {
    columns: Vec<SqliteColumn>,
    rows: Vec<Vec<Value>>,
    last_insert_id: Option<String>,
}

impl Fetched {
    pub(crate) fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Builds the result set. `columns` describes the statement when no
    /// row was returned.
    pub(crate) fn into_result_set(self, columns: &[SqliteColumn]) -> ResultSet {
        let columns = if self.columns.is_empty() {
            columns
        } else {
            &self.columns
        };
        let column_types = columns
            .iter()
            .enumerate()
            .map(|(index, column)| {
                column_type(column.type_info().name()).unwrap_or_else(|| {
                    self.rows
                        .iter()
                        .map(|row| &row[index])
                        .find(|value| !value.is_null())
                        .map_or(ColumnType::Text, inferred_type)
                })
            })
            .collect();

        ResultSet {
            column_names: columns.iter().map(|c| c.name().to_string()).collect(),
            column_types,
            rows: self.rows,
            last_insert_id: self.last_insert_id,
        }
    }
}

/// Reads a statement's result stream row by row, charging each decoded row
/// against `budget` so an oversized response stops before it is buffered.
pub(crate) async fn drain(
    mut stream: RowStream<'_>,
    sql: &str,
    budget: Option<&dyn RowBudget>,
) -> DriverResult<Fetched> {
    let mut fetched = Fetched {
        columns: Vec::new(),
        rows: Vec::new(),
        last_insert_id: None,
    };
    while let Some(item) = stream.try_next().await.map_err(map_sqlx_error)? {
        match item {
            Either::Left(done) => {
                if done.rows_affected() > 0 && is_insert(sql) {
                    fetched.last_insert_id = Some(done.last_insert_rowid().to_string());
                }
            }
            Either::Right(row) => {
                if fetched.columns.is_empty() {
                    fetched.columns = row.columns().to_vec();
                }
                let cells = (0..row.columns().len())
                    .map(|index| decode_cell(&row, index))
                    .collect::<DriverResult<Vec<_>>>()?;
                if let Some(budget) = budget {
                    budget.charge_row(&cells).map_err(DriverError::Mapped)?;
                }
                fetched.rows.push(cells);
            }
        }
    }
    Ok(fetched)
}

/// `last_insert_rowid` is connection state; only statements that insert
/// may report it.
fn is_insert(sql: &str) -> bool {
    let keyword = sql
        .trim_start()
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default();
    keyword.eq_ignore_ascii_case("INSERT") || keyword.eq_ignore_ascii_case("REPLACE")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_inserts_report_rowids() {
        assert!(is_insert("INSERT INTO t VALUES (1)"));
        assert!(is_insert("  replace into t VALUES (1)"));
        assert!(!is_insert("UPDATE t SET a = 1"));
        assert!(!is_insert("SELECT last_insert_rowid()"));
        assert_eq!(column_type("varchar"), Some(ColumnType::Text));
        assert_eq!(column_type("geometry"), None);
    }
}
