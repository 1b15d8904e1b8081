//! Query keys.
//!
//! A key is a sequence of JSON segments. Keys compare, hash and print by
//! their canonical serialization (object members sorted), so
//! `["threats", {"a": 1, "b": 2}]` and `["threats", {"b": 2, "a": 1}]` are
//! the same key.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::hash::{Hash, Hasher};

const LIST: &str = "list";
const DETAIL: &str = "detail";

/// Identifies one cached query.
#[derive(Clone)]
pub struct QueryKey {
    parts: Vec<Value>,
    serialized: String,
}

impl QueryKey {
    /// Build a key from raw segments.
    pub fn new(parts: impl IntoIterator<Item = Value>) -> Self {
        let parts: Vec<Value> = parts.into_iter().map(canonical).collect();
        let serialized = Value::Array(parts.clone()).to_string();
        Self { parts, serialized }
    }

    /// `[entity]`: prefix of every key in the entity's namespace.
    pub fn entity(entity: &str) -> Self {
        Self::new([Value::from(entity)])
    }

    /// `[entity, "list"]`: the unfiltered collection.
    pub fn list(entity: &str) -> Self {
        Self::new([Value::from(entity), Value::from(LIST)])
    }

    /// `[entity, "list", filter]`: a filtered collection.
    pub fn filtered_list(entity: &str, filter: Value) -> Self {
        Self::new([Value::from(entity), Value::from(LIST), filter])
    }

    /// `[entity, "detail", id]`: a single entity.
    pub fn detail(entity: &str, id: impl Into<Value>) -> Self {
        Self::new([Value::from(entity), Value::from(DETAIL), id.into()])
    }

    /// Append a segment.
    pub fn with(&self, part: impl Into<Value>) -> Self {
        let mut parts = self.parts.clone();
        parts.push(part.into());
        Self::new(parts)
    }

    pub fn parts(&self) -> &[Value] {
        &self.parts
    }

    /// Canonical serialization.
    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    /// First segment, when it is a string.
    pub fn entity_name(&self) -> Option<&str> {
        self.parts.first().and_then(Value::as_str)
    }

    /// True for `[entity, "list", ..]` keys.
    pub fn is_list(&self) -> bool {
        self.parts.get(1).and_then(Value::as_str) == Some(LIST)
    }

    /// True if `prefix`'s segments are a leading run of this key's.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        prefix.parts.len() <= self.parts.len()
            && prefix.parts.iter().zip(&self.parts).all(|(a, b)| a == b)
    }
}

/// Rebuild objects with sorted members at every depth.
fn canonical(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, canonical(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonical).collect()),
        other => other,
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.serialized == other.serialized
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serialized.hash(state);
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({})", self.serialized)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialized)
    }
}

impl From<&str> for QueryKey {
    fn from(s: &str) -> Self {
        Self::new([Value::from(s)])
    }
}

impl From<String> for QueryKey {
    fn from(s: String) -> Self {
        Self::new([Value::from(s)])
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(parts: Vec<Value>) -> Self {
        Self::new(parts)
    }
}

impl From<&QueryKey> for QueryKey {
    fn from(key: &QueryKey) -> Self {
        key.clone()
    }
}

impl Serialize for QueryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.parts.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueryKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<Value>::deserialize(deserializer).map(Self::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_order_does_not_matter() {
        let a = QueryKey::new([json!("threats"), json!({"a": 1, "b": {"y": 2, "x": 1}})]);
        let b = QueryKey::new([json!("threats"), json!({"b": {"x": 1, "y": 2}, "a": 1})]);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), b.as_str());
    }

    #[test]
    fn test_conventions() {
        assert_eq!(QueryKey::list("cases").as_str(), r#"["cases","list"]"#);
        assert_eq!(QueryKey::detail("cases", 42).as_str(), r#"["cases","detail",42]"#);
        assert!(QueryKey::filtered_list("cases", json!({"open": true})).is_list());
        assert!(!QueryKey::detail("cases", "a").is_list());
        assert_eq!(QueryKey::from("threats").entity_name(), Some("threats"));
    }

    #[test]
    fn test_prefix_matching() {
        let entity = QueryKey::entity("cases");
        let list = QueryKey::list("cases");
        let detail = QueryKey::detail("cases", "7");

        assert!(list.starts_with(&entity));
        assert!(detail.starts_with(&entity));
        assert!(!detail.starts_with(&list));
        assert!(!QueryKey::entity("threats").starts_with(&entity));
        assert!(entity.starts_with(&entity));
    }

    #[test]
    fn test_number_and_string_ids_differ() {
        assert_ne!(QueryKey::detail("cases", 7), QueryKey::detail("cases", "7"));
    }

    #[test]
    fn test_serde() {
        let key = QueryKey::detail("actors", "apt-29");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"["actors","detail","apt-29"]"#);
        let back: QueryKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
