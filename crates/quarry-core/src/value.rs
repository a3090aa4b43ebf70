//! Dynamic cell values exchanged between drivers, plans and callers.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
pub use bigdecimal::BigDecimal as Decimal;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime};
pub use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::CanonicalError;

/// A nested result object: field name to value, ordered by key.
pub type Record = BTreeMap<String, Value>;

/// Key under which a tagged value stores its type name.
pub const TYPE_TAG: &str = "$type";

/// Parses an arbitrary-precision decimal and strips trailing zeros.
///
/// # Errors
///
/// Returns `ConversionError` when `text` is not a decimal number.
pub fn parse_decimal(text: &str) -> Result<Decimal, CanonicalError> {
    text.trim()
        .parse::<Decimal>()
        .map(|decimal| decimal.normalized())
        .map_err(|e| CanonicalError::conversion(format!("`{text}` is not a valid decimal: {e}")))
}

/// Parses an arbitrary-precision integer.
///
/// # Errors
///
/// Returns `ConversionError` when `text` is not an integer.
pub fn parse_bigint(text: &str) -> Result<BigInt, CanonicalError> {
    text.trim()
        .parse::<BigInt>()
        .map_err(|e| CanonicalError::conversion(format!("`{text}` is not a valid integer: {e}")))
}

/// A single dynamically typed value.
///
/// Integers beyond `i64` and all decimals stay lossless (`num-bigint` and
/// `bigdecimal`); nothing here ever rounds through `f64`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i64),
    BigInt(BigInt),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<FixedOffset>),
    Date(NaiveDate),
    Time(NaiveTime),
    Uuid(Uuid),
    Json(JsonValue),
    List(Vec<Value>),
    Object(Record),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short type name used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "Null",
            Self::Boolean(_) => "Boolean",
            Self::Int(_) => "Int",
            Self::BigInt(_) => "BigInt",
            Self::Float(_) => "Float",
            Self::Decimal(_) => "Decimal",
            Self::Text(_) => "Text",
            Self::Bytes(_) => "Bytes",
            Self::DateTime(_) => "DateTime",
            Self::Date(_) => "Date",
            Self::Time(_) => "Time",
            Self::Uuid(_) => "Uuid",
            Self::Json(_) => "Json",
            Self::List(_) => "List",
            Self::Object(_) => "Object",
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::BigInt(v) => v.to_i64(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_object(&self) -> Option<&Record> {
        match self {
            Self::Object(record) => Some(record),
            _ => None,
        }
    }

    /// Parses a big integer, collapsing it to [`Value::Int`] when it fits.
    ///
    /// # Errors
    ///
    /// Returns `ConversionError` when `digits` is not an integer.
    pub fn integer_from_str(digits: &str) -> Result<Self, CanonicalError> {
        let big = parse_bigint(digits)?;
        Ok(match big.to_i64() {
            Some(v) => Self::Int(v),
            None => Self::BigInt(big),
        })
    }

    /// Form used when values are compared as correlation keys: integers that
    /// fit `i64` compare equal regardless of their representation.
    #[must_use]
    pub fn normalized(&self) -> Self {
        match self {
            Self::BigInt(big) => big.to_i64().map_or_else(|| self.clone(), Self::Int),
            Self::List(items) => Self::List(items.iter().map(Self::normalized).collect()),
            other => other.clone(),
        }
    }

    /// Total ordering between comparable values; `None` for mismatched kinds.
    ///
    /// Numbers compare across representations without losing precision
    /// except when a float is involved.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Boolean(a), Self::Boolean(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Int(a), Self::Float(b)) => (*a as f64).partial_cmp(b),
            (Self::Float(a), Self::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Self::Float(a), Self::Decimal(b)) => b.to_f64().and_then(|b| a.partial_cmp(&b)),
            (Self::Decimal(a), Self::Float(b)) => a.to_f64().and_then(|a| a.partial_cmp(b)),
            (Self::Float(a), Self::BigInt(b)) => b.to_f64().and_then(|b| a.partial_cmp(&b)),
            (Self::BigInt(a), Self::Float(b)) => a.to_f64().and_then(|a| a.partial_cmp(b)),
            (Self::Int(_) | Self::BigInt(_) | Self::Decimal(_), Self::Int(_) | Self::BigInt(_) | Self::Decimal(_)) => {
                Some(self.exact_number()?.cmp(&other.exact_number()?))
            }
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Bytes(a), Self::Bytes(b)) => Some(a.cmp(b)),
            (Self::DateTime(a), Self::DateTime(b)) => Some(a.cmp(b)),
            (Self::Date(a), Self::Date(b)) => Some(a.cmp(b)),
            (Self::Time(a), Self::Time(b)) => Some(a.cmp(b)),
            (Self::Uuid(a), Self::Uuid(b)) => Some(a.cmp(b)),
            (Self::Uuid(a), Self::Text(b)) => b.parse::<Uuid>().ok().map(|b| a.cmp(&b)),
            (Self::Text(a), Self::Uuid(b)) => a.parse::<Uuid>().ok().map(|a| a.cmp(b)),
            _ => None,
        }
    }

    /// Equality used by filters: numeric-aware, structural for containers.
    #[must_use]
    pub fn loosely_equals(&self, other: &Self) -> bool {
        match self.compare(other) {
            Some(ordering) => ordering == Ordering::Equal,
            None => self == other,
        }
    }

    fn exact_number(&self) -> Option<Decimal> {
        match self {
            Self::Int(v) => Some(Decimal::from(*v)),
            Self::BigInt(v) => Some(Decimal::new(v.clone(), 0)),
            Self::Decimal(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Approximate size of the value once rendered as JSON, in bytes.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        match self {
            Self::Null => 4,
            Self::Boolean(_) => 5,
            Self::Int(_) | Self::Float(_) => 20,
            Self::BigInt(v) => v.to_string().len() + 32,
            Self::Decimal(v) => v.to_plain_string().len() + 32,
            Self::Text(s) => s.len() + 2,
            Self::Bytes(b) => b.len().div_ceil(3) * 4 + 32,
            Self::DateTime(_) => 64,
            Self::Date(_) | Self::Time(_) => 40,
            Self::Uuid(_) => 38,
            Self::Json(json) => json.to_string().len() + 32,
            Self::List(items) => 2 + items.iter().map(|v| v.estimated_size() + 1).sum::<usize>(),
            Self::Object(record) => record_size(record),
        }
    }

    /// Decodes the JSON wire form, including `{"$type", "value"}` tags.
    ///
    /// # Errors
    ///
    /// Returns `ConversionError` when a tagged value cannot be decoded.
    pub fn from_json(json: JsonValue) -> Result<Self, CanonicalError> {
        Ok(match json {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Boolean(b),
            JsonValue::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Self::Int(v)
                } else if let Some(v) = n.as_u64() {
                    Self::BigInt(BigInt::from(v))
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(s) => Self::Text(s),
            JsonValue::Array(items) => Self::List(
                items
                    .into_iter()
                    .map(Self::from_json)
                    .collect::<Result<_, _>>()?,
            ),
            JsonValue::Object(map) => {
                if map.len() == 2 && map.contains_key(TYPE_TAG) && map.contains_key("value") {
                    if let Some(tag) = map.get(TYPE_TAG).and_then(JsonValue::as_str) {
                        let tag = tag.to_string();
                        let value = map.get("value").cloned().unwrap_or(JsonValue::Null);
                        return Self::from_tagged(&tag, value);
                    }
                }
                Self::Object(
                    map.into_iter()
                        .map(|(k, v)| Ok((k, Self::from_json(v)?)))
                        .collect::<Result<_, CanonicalError>>()?,
                )
            }
        })
    }

    fn from_tagged(tag: &str, value: JsonValue) -> Result<Self, CanonicalError> {
        if tag == "Json" {
            return Ok(Self::Json(value));
        }
        let text = match &value {
            JsonValue::String(s) => s.clone(),
            JsonValue::Number(n) => n.to_string(),
            other => {
                return Err(CanonicalError::conversion(format!(
                    "tagged {tag} value must be a string, got {other}"
                )))
            }
        };
        let invalid = |err: &dyn fmt::Display| {
            CanonicalError::conversion(format!("invalid {tag} value `{text}`: {err}"))
        };
        match tag {
            "BigInt" => Ok(Self::BigInt(parse_bigint(&text)?)),
            "Decimal" => Ok(Self::Decimal(parse_decimal(&text)?)),
            "DateTime" => DateTime::parse_from_rfc3339(&text)
                .map(Self::DateTime)
                .map_err(|e| invalid(&e)),
            "Date" => NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                .map(Self::Date)
                .map_err(|e| invalid(&e)),
            "Time" => NaiveTime::parse_from_str(&text, "%H:%M:%S%.f")
                .map(Self::Time)
                .map_err(|e| invalid(&e)),
            "Bytes" => BASE64.decode(&text).map(Self::Bytes).map_err(|e| invalid(&e)),
            "Uuid" => text.parse().map(Self::Uuid).map_err(|e| invalid(&e)),
            other => Err(CanonicalError::conversion(format!(
                "unknown value tag `{other}`"
            ))),
        }
    }

    /// Builds the JSON wire form.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// Approximate JSON size of a record, in bytes.
#[must_use]
pub fn record_size(record: &Record) -> usize {
    2 + record
        .iter()
        .map(|(k, v)| k.len() + 4 + v.estimated_size())
        .sum::<usize>()
}

/// Looks up a dotted path (`author.profile.name`) inside a record.
#[must_use]
pub fn get_path<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = record.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Stable string key for a tuple of values, used to correlate rows.
#[must_use]
pub fn correlation_key(values: &[Value]) -> String {
    let normalized = Value::List(values.iter().map(Value::normalized).collect());
    serde_json::to_string(&normalized).unwrap_or_default()
}

struct Tagged<'a, T: Serialize + ?Sized>(&'a str, &'a T);

impl<T: Serialize + ?Sized> Serialize for Tagged<'_, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry(TYPE_TAG, self.0)?;
        map.serialize_entry("value", self.1)?;
        map.end()
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Boolean(b) => serializer.serialize_bool(*b),
            Self::Int(v) => serializer.serialize_i64(*v),
            Self::Float(v) => serializer.serialize_f64(*v),
            Self::BigInt(v) => Tagged("BigInt", &v.to_string()).serialize(serializer),
            Self::Decimal(v) => Tagged("Decimal", &v.to_plain_string()).serialize(serializer),
            Self::Text(s) => serializer.serialize_str(s),
            Self::Bytes(b) => Tagged("Bytes", &BASE64.encode(b)).serialize(serializer),
            Self::DateTime(dt) => Tagged("DateTime", &dt.to_rfc3339()).serialize(serializer),
            Self::Date(d) => Tagged("Date", &d.format("%Y-%m-%d").to_string()).serialize(serializer),
            Self::Time(t) => Tagged("Time", &t.format("%H:%M:%S%.f").to_string()).serialize(serializer),
            Self::Uuid(u) => serializer.serialize_str(&u.to_string()),
            Self::Json(json) => Tagged("Json", json).serialize(serializer),
            Self::List(items) => items.serialize(serializer),
            Self::Object(record) => record.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = JsonValue::deserialize(deserializer)?;
        Self::from_json(json).map_err(D::Error::custom)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<Record> for Value {
    fn from(value: Record) -> Self {
        Self::Object(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
