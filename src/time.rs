//! Timestamp helpers shared by conflict resolution and sync events.
//!
//! Server payloads carry timestamps either as RFC 3339 strings or as epoch
//! milliseconds; both are accepted.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serializer};
use serde_json::Value;

/// Parse a JSON timestamp (RFC 3339 string or epoch milliseconds).
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}

/// Read an entity's last-update timestamp (`updatedAt` or `updated_at`).
pub fn updated_at(entity: &Value) -> Option<DateTime<Utc>> {
    let obj = entity.as_object()?;
    obj.get("updatedAt")
        .or_else(|| obj.get("updated_at"))
        .and_then(parse_timestamp)
}

/// Serde adapter for timestamps that may arrive as strings or numbers.
pub mod flexible {
    use super::*;

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        parse_timestamp(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_rfc3339() {
        let ts = parse_timestamp(&json!("2024-03-01T10:00:00Z")).unwrap();
        assert_eq!(ts.timestamp(), 1_709_287_200);
    }

    #[test]
    fn test_parse_millis() {
        let ts = parse_timestamp(&json!(1_709_287_200_000i64)).unwrap();
        assert_eq!(ts.timestamp(), 1_709_287_200);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_timestamp(&json!("yesterday")).is_none());
        assert!(parse_timestamp(&json!(null)).is_none());
    }

    #[test]
    fn test_updated_at_field_names() {
        assert!(updated_at(&json!({"updatedAt": "2024-03-01T10:00:00Z"})).is_some());
        assert!(updated_at(&json!({"updated_at": 1000})).is_some());
        assert!(updated_at(&json!({"id": 1})).is_none());
        assert!(updated_at(&json!([1, 2])).is_none());
    }
}
