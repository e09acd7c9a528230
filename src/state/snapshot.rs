//! Versioned, checksummed snapshot records.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::now_ms;

/// Schema version stamped on every snapshot.
pub const SNAPSHOT_VERSION: &str = "1.0";

/// Persisted form of a single state value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub data: Value,
    pub checksum: String,
}

impl StateSnapshot {
    /// Stamp `data` with the current time, version and checksum.
    pub fn new(data: Value) -> Self {
        Self {
            version: SNAPSHOT_VERSION.to_string(),
            timestamp: now_ms(),
            checksum: checksum(&data),
            data,
        }
    }

    /// Whether the stored checksum matches the payload.
    pub fn verify(&self) -> bool {
        self.checksum == checksum(&self.data)
    }

    /// Age relative to `now` (ms). Future timestamps count as zero.
    pub fn age(&self, now: u64) -> Duration {
        Duration::from_millis(now.saturating_sub(self.timestamp))
    }

    pub fn is_expired(&self, ttl: Option<Duration>, now: u64) -> bool {
        ttl.is_some_and(|ttl| self.age(now) > ttl)
    }
}

/// Composite record written on state-saving and replayed on state-loading.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub timestamp: u64,
    /// Keyed by `<scope>:<storage key>`
    pub snapshots: BTreeMap<String, StateSnapshot>,
}

/// Hex blake3 digest of the payload's canonical JSON.
///
/// Object keys are sorted first, so the digest does not depend on the
/// order fields were inserted in.
pub fn checksum(data: &Value) -> String {
    let canonical = canonicalize(data).to_string();
    hex::encode(blake3::hash(canonical.as_bytes()).as_bytes())
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let sorted: Map<String, Value> = keys
                .into_iter()
                .map(|k| (k.clone(), canonicalize(&map[k])))
                .collect();
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checksum_is_stable() {
        let a = json!({ "v": 1, "nodes": ["a", "b"] });
        assert_eq!(checksum(&a), checksum(&a.clone()));
        assert_eq!(checksum(&a).len(), 64);
    }

    #[test]
    fn test_checksum_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":{"b":2,"a":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":{"a":3,"b":2},"x":1}"#).unwrap();
        assert_eq!(checksum(&a), checksum(&b));
    }

    #[test]
    fn test_checksum_detects_changes() {
        assert_ne!(checksum(&json!({ "v": 1 })), checksum(&json!({ "v": 2 })));
        assert_ne!(checksum(&json!([1, 2])), checksum(&json!([2, 1])));
    }

    #[test]
    fn test_verify_after_tamper() {
        let mut snapshot = StateSnapshot::new(json!({ "v": 1 }));
        assert!(snapshot.verify());
        assert_eq!(snapshot.version, "1.0");

        snapshot.checksum = "bad".into();
        assert!(!snapshot.verify());
    }

    #[test]
    fn test_expiry() {
        let mut snapshot = StateSnapshot::new(json!(null));
        snapshot.timestamp = 1_000;

        assert!(!snapshot.is_expired(None, 1_000_000));
        assert!(!snapshot.is_expired(Some(Duration::from_secs(10)), 6_000));
        assert!(snapshot.is_expired(Some(Duration::from_secs(10)), 12_000));
        assert_eq!(snapshot.age(500), Duration::ZERO);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let snapshot = StateSnapshot::new(json!({ "v": 1 }));
        let value = serde_json::to_value(&snapshot).unwrap();
        let mut fields: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        fields.sort();
        assert_eq!(fields, vec!["checksum", "data", "timestamp", "version"]);
    }
}
