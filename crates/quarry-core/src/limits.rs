//! Process-wide resource ceilings.

use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Read-only limits applied to every request once the engine is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Ceiling on the serialized size of a single response, in bytes.
    #[serde(deserialize_with = "de_byte_size")]
    pub max_response_size: u64,

    /// Deadline applied to every individual adapter call.
    #[serde(with = "duration_serde")]
    pub query_timeout: Duration,

    /// Maximum time a transaction may stay open.
    #[serde(with = "duration_serde")]
    pub max_transaction_timeout: Duration,

    /// Maximum time spent waiting for a transaction's connection.
    #[serde(with = "duration_serde")]
    pub max_transaction_wait_time: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_response_size: 128 * 1024 * 1024,
            query_timeout: Duration::from_secs(30),
            max_transaction_timeout: Duration::from_secs(5),
            max_transaction_wait_time: Duration::from_secs(2),
        }
    }
}

/// Parses `"128 MiB"`, `"1GB"`, `"512KiB"` or a bare byte count.
#[must_use]
pub fn parse_byte_size(input: &str) -> Option<u64> {
    input.trim().parse::<ByteSize>().ok().map(|size| size.as_u64())
}

/// Parses humantime shorthand (`5s`, `500ms`, `2m`, `1h 30m`), ISO-8601
/// durations (`PT5S`, `PT1M30S`, `P1DT2H`) and bare seconds.
#[must_use]
pub fn parse_duration(input: &str) -> Option<Duration> {
    let trimmed = input.trim();
    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    if trimmed.starts_with(['P', 'p']) {
        return parse_iso8601(trimmed);
    }
    humantime::parse_duration(trimmed).ok()
}

/// Rewrites `P[nD][T[nH][nM][nS]]` into humantime form.
fn parse_iso8601(input: &str) -> Option<Duration> {
    let body = &input[1..];
    let (date, time) = body.split_once(['T', 't']).unwrap_or((body, ""));
    if date.is_empty() && time.is_empty() {
        return None;
    }
    let days = match date {
        "" => String::new(),
        date => format!("{}d ", date.strip_suffix(['D', 'd'])?),
    };
    let time: String = time
        .chars()
        .flat_map(|c| {
            if c.is_ascii_alphabetic() {
                vec![c.to_ascii_lowercase(), ' ']
            } else {
                vec![c]
            }
        })
        .collect();
    humantime::parse_duration(format!("{days}{time}").trim()).ok()
}

fn de_byte_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bytes(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Bytes(bytes) => Ok(bytes),
        Raw::Text(text) => parse_byte_size(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid byte size `{text}`"))),
    }
}

/// Serde helper for durations, written in humantime format.
pub mod duration_serde {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        humantime::format_duration(*value)
            .to_string()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse_duration(&text)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid duration `{text}`"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_sizes_accept_binary_and_decimal_units() {
        assert_eq!(parse_byte_size("128 MiB"), Some(128 * 1024 * 1024));
        assert_eq!(parse_byte_size("1GB"), Some(1_000_000_000));
        assert_eq!(parse_byte_size("2048"), Some(2048));
        assert_eq!(parse_byte_size("12 parsecs"), None);
    }

    #[test]
    fn test_durations_accept_iso_and_shorthand() {
        assert_eq!(parse_duration("PT5S"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("PT1M30S"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("P1DT2H"), Some(Duration::from_secs(26 * 3_600)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h 30m"), Some(Duration::from_secs(5_400)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("PT"), None);
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn test_durations_serialize_in_humantime_form() {
        #[derive(Serialize)]
        struct Wrapper {
            #[serde(with = "duration_serde")]
            timeout: Duration,
        }
        let json = serde_json::to_value(Wrapper {
            timeout: Duration::from_millis(1_500),
        })
        .unwrap();
        assert_eq!(json["timeout"], "1s 500ms");
        assert_eq!(parse_duration("1s 500ms"), Some(Duration::from_millis(1_500)));
    }

    #[test]
    fn test_limits_deserialize_from_toml() {
        let limits: ResourceLimits = toml::from_str(
            r#"
            max_response_size = "1 MiB"
            query_timeout = "PT10S"
            max_transaction_wait_time = "250ms"
            "#,
        )
        .unwrap();

        assert_eq!(limits.max_response_size, 1024 * 1024);
        assert_eq!(limits.query_timeout, Duration::from_secs(10));
        assert_eq!(limits.max_transaction_wait_time, Duration::from_millis(250));
        assert_eq!(limits.max_transaction_timeout, Duration::from_secs(5));
    }
}
