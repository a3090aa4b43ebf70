//! Result serializer
//!
//! Turns flat result sets into records. A column named `author.profile.name`
//! lands at `record["author"]["profile"]["name"]`; columns sharing a dotted
//! prefix share one nested object. The output depends only on the set of
//! column paths, never on their order.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use num_traits::ToPrimitive;
use quarry_core::{
    parse_decimal, CanonicalError, ColumnType, Decimal, EngineResult, Record, ResultSet, Value,
};

/// Serializes every row of `result_set` into a nested record.
///
/// # Errors
///
/// `ConversionError` when a row has the wrong width, two column paths
/// collide (`a` and `a.b`) or a cell cannot be coerced to its column type.
pub fn serialize(result_set: &ResultSet) -> EngineResult<Vec<Record>> {
    if result_set.rows.is_empty() {
        return Ok(Vec::new());
    }
    result_set.validate()?;
    let paths = column_paths(&result_set.column_names)?;

    let mut records = Vec::with_capacity(result_set.rows.len());
    for row in &result_set.rows {
        let mut record = Record::new();
        for (index, (path, cell)) in paths.iter().zip(row).enumerate() {
            let value = match result_set.column_types.get(index) {
                Some(column_type) => coerce(cell.clone(), column_type)?,
                None => cell.clone(),
            };
            insert_path(&mut record, path, value)?;
        }
        records.push(record);
    }
    Ok(records)
}

/// Splits column names into path segments, rejecting duplicates and paths
/// that would place a value where another column needs an object.
fn column_paths(names: &[String]) -> EngineResult<Vec<Vec<&str>>> {
    let paths: Vec<Vec<&str>> = names.iter().map(|name| name.split('.').collect()).collect();
    for (i, a) in paths.iter().enumerate() {
        for b in &paths[i + 1..] {
            let shared = a.len().min(b.len());
            if a[..shared] == b[..shared] {
                return Err(CanonicalError::conversion(format!(
                    "column paths `{}` and `{}` conflict",
                    a.join("."),
                    b.join(".")
                )));
            }
        }
    }
    Ok(paths)
}

fn insert_path(record: &mut Record, path: &[&str], value: Value) -> EngineResult<()> {
    let Some((leaf, parents)) = path.split_last() else {
        return Ok(());
    };
    let mut current = record;
    for segment in parents {
        let entry = current
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Record::new()));
        current = match entry {
            Value::Object(nested) => nested,
            _ => {
                return Err(CanonicalError::conversion(format!(
                    "column path `{}` crosses a scalar at `{segment}`",
                    path.join(".")
                )))
            }
        };
    }
    current.insert((*leaf).to_string(), value);
    Ok(())
}

fn invalid(column_type: &ColumnType, raw: impl fmt::Display) -> CanonicalError {
    CanonicalError::conversion(format!("cannot convert `{raw}` to {column_type:?}"))
}

/// Converts a raw driver cell into the value its column type promises.
///
/// Drivers hand back what their wire protocol carries (text for big
/// integers and decimals, integers for booleans, ...). Values that already
/// have the right shape pass through untouched.
///
/// # Errors
///
/// `ConversionError` when the cell cannot represent the column type.
pub fn coerce(value: Value, column_type: &ColumnType) -> EngineResult<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match (column_type, value) {
        (ColumnType::Int32 | ColumnType::Int64, Value::Text(text)) => {
            Value::integer_from_str(&text).map_err(|_| invalid(column_type, text))
        }
        (ColumnType::Int32 | ColumnType::Int64, Value::BigInt(big)) => {
            Ok(Value::BigInt(big).normalized())
        }
        (ColumnType::Float | ColumnType::Double, Value::Int(i)) => Ok(Value::Float(i as f64)),
        (ColumnType::Float | ColumnType::Double, Value::Text(text)) => text
            .trim()
            .parse()
            .map(Value::Float)
            .map_err(|_| invalid(column_type, text)),
        (ColumnType::Float | ColumnType::Double, Value::Decimal(decimal)) => decimal
            .to_f64()
            .map(Value::Float)
            .ok_or_else(|| invalid(column_type, decimal)),
        (ColumnType::Numeric, Value::Int(i)) => Ok(Value::Decimal(Decimal::from(i))),
        (ColumnType::Numeric, Value::BigInt(big)) => Ok(Value::Decimal(Decimal::new(big, 0))),
        (ColumnType::Numeric, Value::Float(f)) if f.is_finite() => {
            Ok(Value::Decimal(parse_decimal(&f.to_string())?))
        }
        (ColumnType::Numeric, Value::Text(text)) => parse_decimal(&text)
            .map(Value::Decimal)
            .map_err(|_| invalid(column_type, text)),
        (ColumnType::UnknownNumber, Value::Text(text)) => Value::integer_from_str(&text)
            .or_else(|_| parse_decimal(&text).map(Value::Decimal))
            .map_err(|_| invalid(column_type, text)),
        (ColumnType::Boolean, Value::Int(i)) => match i {
            0 => Ok(Value::Boolean(false)),
            1 => Ok(Value::Boolean(true)),
            other => Err(invalid(column_type, other)),
        },
        (ColumnType::Boolean, Value::Text(text)) => {
            match text.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Ok(Value::Boolean(true)),
                "false" | "f" | "0" => Ok(Value::Boolean(false)),
                _ => Err(invalid(column_type, text)),
            }
        }
        (ColumnType::DateTime, Value::Text(text)) => {
            parse_datetime(&text).ok_or_else(|| invalid(column_type, text))
        }
        (ColumnType::DateTime, Value::Int(millis)) => Utc
            .timestamp_millis_opt(millis)
            .single()
            .map(|dt| Value::DateTime(dt.into()))
            .ok_or_else(|| invalid(column_type, millis)),
        (ColumnType::Date, Value::Text(text)) => NaiveDate::parse_from_str(&text, "%Y-%m-%d")
            .map(Value::Date)
            .ok()
            .or_else(|| match parse_datetime(&text) {
                Some(Value::DateTime(dt)) => Some(Value::Date(dt.date_naive())),
                _ => None,
            })
            .ok_or_else(|| invalid(column_type, text)),
        (ColumnType::Date, Value::DateTime(dt)) => Ok(Value::Date(dt.date_naive())),
        (ColumnType::Time, Value::Text(text)) => NaiveTime::parse_from_str(&text, "%H:%M:%S%.f")
            .or_else(|_| NaiveTime::parse_from_str(&text, "%H:%M"))
            .map(Value::Time)
            .map_err(|_| invalid(column_type, text)),
        (ColumnType::Json, Value::Text(text)) => serde_json::from_str(&text)
            .map(Value::Json)
            .map_err(|_| invalid(column_type, text)),
        (ColumnType::Bytes, Value::Text(text)) => Ok(Value::Bytes(text.into_bytes())),
        (ColumnType::Uuid, Value::Text(text)) => text
            .parse::<uuid::Uuid>()
            .map(Value::Uuid)
            .map_err(|_| invalid(column_type, text)),
        (ColumnType::Uuid, Value::Bytes(bytes)) => uuid::Uuid::from_slice(&bytes)
            .map(Value::Uuid)
            .map_err(|_| invalid(column_type, format!("{} bytes", bytes.len()))),
        (ColumnType::Array(inner), Value::List(items)) => items
            .into_iter()
            .map(|item| coerce(item, inner))
            .collect::<EngineResult<Vec<_>>>()
            .map(Value::List),
        (ColumnType::Array(inner), Value::Text(text)) => {
            let json: serde_json::Value =
                serde_json::from_str(&text).map_err(|_| invalid(column_type, &text))?;
            if !json.is_array() {
                return Err(invalid(column_type, text));
            }
            coerce(Value::from_json(json)?, &ColumnType::Array(inner.clone()))
        }
        (ColumnType::Array(_), other) => Err(invalid(column_type, other.type_name())),
        (_, other) => Ok(other),
    }
}

fn parse_datetime(text: &str) -> Option<Value> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(Value::DateTime(dt));
    }
    if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(Value::DateTime(dt));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| Value::DateTime(Utc.from_utc_datetime(&naive).into()))
}
