use quarry_core::{CanonicalError, Record, Value};
use serde_json::{json, Value as JsonValue};

/// Result of evaluating a plan node.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Serialized rows of a read, or records shaped in memory.
    Records(Vec<Record>),
    /// Affected-row count of a write.
    Affected(u64),
    /// One outcome per batch child, in declaration order.
    Batch(Vec<BatchOutcome>),
}

/// Outcome of a single batch child.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Data(Output),
    Error(CanonicalError),
    /// Not attempted because an earlier sibling failed under the `abort`
    /// policy.
    Skipped,
}

impl Output {
    pub fn records(&self) -> Option<&[Record]> {
        match self {
            Self::Records(records) => Some(records),
            _ => None,
        }
    }

    pub fn into_records(self) -> Option<Vec<Record>> {
        match self {
            Self::Records(records) => Some(records),
            _ => None,
        }
    }

    /// JSON payload returned to callers.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Records(records) => JsonValue::Array(
                records
                    .iter()
                    .map(|record| Value::Object(record.clone()).to_json())
                    .collect(),
            ),
            Self::Affected(count) => json!({ "count": count }),
            Self::Batch(outcomes) => {
                JsonValue::Array(outcomes.iter().map(BatchOutcome::to_json).collect())
            }
        }
    }
}

impl BatchOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Data(output) => json!({ "data": output.to_json() }),
            Self::Error(error) => json!({ "error": error }),
            Self::Skipped => json!({ "skipped": true }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::ErrorKind;

    #[test]
    fn test_batch_payload_shape() {
        let mut record = Record::new();
        record.insert("id".into(), Value::Int(1));
        let output = Output::Batch(vec![
            BatchOutcome::Data(Output::Records(vec![record])),
            BatchOutcome::Error(CanonicalError::new(ErrorKind::TableDoesNotExist, "missing")),
            BatchOutcome::Skipped,
        ]);
        let json = output.to_json();
        assert_eq!(json[0]["data"][0]["id"], 1);
        assert_eq!(json[1]["error"]["kind"], "TableDoesNotExist");
        assert_eq!(json[2]["skipped"], true);
    }
}
