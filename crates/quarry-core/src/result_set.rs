//! Flat columnar results as returned by driver adapters.

use serde::{Deserialize, Serialize};

use crate::error::{CanonicalError, EngineResult};
use crate::value::Value;

/// Declared type of a result column, used to coerce raw cells.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Int32,
    Int64,
    Float,
    Double,
    Numeric,
    Boolean,
    Character,
    Text,
    Date,
    Time,
    DateTime,
    Json,
    Enum,
    Bytes,
    Uuid,
    /// Numeric column whose exact width the driver could not report.
    UnknownNumber,
    Array(Box<ColumnType>),
}

/// Flat result of a raw query.
///
/// `column_names` may encode nested paths joined by `.`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSet {
    pub column_names: Vec<String>,
    pub column_types: Vec<ColumnType>,
    pub rows: Vec<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<String>,
}

impl ResultSet {
    /// Creates an empty result set with the given columns.
    #[must_use]
    pub fn new(columns: Vec<(String, ColumnType)>) -> Self {
        let (column_names, column_types) = columns.into_iter().unzip();
        Self {
            column_names,
            column_types,
            rows: Vec::new(),
            last_insert_id: None,
        }
    }

    /// Appends a row (builder pattern).
    #[must_use]
    pub fn with_row(mut self, row: Vec<Value>) -> Self {
        self.rows.push(row);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Checks that names, types and every row agree in width.
    ///
    /// # Errors
    ///
    /// Returns `ConversionError` describing the first mismatch.
    pub fn validate(&self) -> EngineResult<()> {
        let width = self.column_names.len();
        if self.column_types.len() != width {
            return Err(CanonicalError::conversion(format!(
                "result set declares {width} column names but {} column types",
                self.column_types.len()
            )));
        }
        if let Some((index, row)) = self.rows.iter().enumerate().find(|(_, r)| r.len() != width) {
            return Err(CanonicalError::conversion(format!(
                "row {index} has {} values, expected {width}",
                row.len()
            )));
        }
        Ok(())
    }

    /// Concatenates the rows of another result set with the same columns.
    ///
    /// # Errors
    ///
    /// Returns `ConversionError` when the column lists differ.
    pub fn append(&mut self, other: ResultSet) -> EngineResult<()> {
        if self.column_names.is_empty() && self.rows.is_empty() {
            *self = other;
            return Ok(());
        }
        if other.column_names != self.column_names {
            return Err(CanonicalError::conversion(
                "cannot merge result sets with different columns",
            ));
        }
        self.rows.extend(other.rows);
        if other.last_insert_id.is_some() {
            self.last_insert_id = other.last_insert_id;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> ResultSet {
        ResultSet::new(vec![
            ("id".into(), ColumnType::Int64),
            ("name".into(), ColumnType::Text),
        ])
    }

    #[test]
    fn test_validate_rejects_short_rows() {
        let rs = users()
            .with_row(vec![Value::Int(1), Value::from("ada")])
            .with_row(vec![Value::Int(2)]);
        let err = rs.validate().unwrap_err();
        assert!(err.message.contains("row 1"));
    }

    #[test]
    fn test_append_merges_rows_with_same_columns() {
        let mut first = users().with_row(vec![Value::Int(1), Value::from("ada")]);
        let second = users().with_row(vec![Value::Int(2), Value::from("grace")]);
        first.append(second).unwrap();
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_append_into_empty_takes_other_columns() {
        let mut acc = ResultSet::default();
        acc.append(users()).unwrap();
        assert_eq!(acc.column_names, vec!["id", "name"]);
    }

    #[test]
    fn test_column_types_serialize_with_nested_arrays() {
        let json = serde_json::to_value(ColumnType::Array(Box::new(ColumnType::Int32))).unwrap();
        assert_eq!(json, serde_json::json!({ "Array": "Int32" }));
    }
}
