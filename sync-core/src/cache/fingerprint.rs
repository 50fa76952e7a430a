//! Canonical request fingerprints.
//!
//! A request is identified by `(namespace, operation, params)`. Object keys in
//! `params` are sorted at every nesting level before serialization, so two
//! logically identical calls built with different key-insertion order collide.

use serde_json::{Map, Value};
use std::fmt;

/// Canonical cache / dedup key.
///
/// Renders as `namespace:operation:<canonical params json>`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    namespace: String,
    operation: String,
    params: String,
}

impl Fingerprint {
    /// Compute the fingerprint of a request.
    pub fn new(namespace: &str, operation: &str, params: &Value) -> Self {
        Self {
            namespace: namespace.to_string(),
            operation: operation.to_string(),
            params: canonicalize(params).to_string(),
        }
    }

    /// The namespace component.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The operation component.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// The canonical JSON of the parameters.
    pub fn params(&self) -> &str {
        &self.params
    }

    /// Whether this key falls under `namespace:` (and `operation:` if given).
    pub fn is_within(&self, namespace: &str, operation: Option<&str>) -> bool {
        self.namespace == namespace && operation.map_or(true, |op| self.operation == op)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.operation, self.params)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Rebuild `value` with every object's keys in lexicographic order.
///
/// Works whether or not serde_json's `preserve_order` feature is enabled
/// somewhere in the dependency graph.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
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
    fn key_order_does_not_matter() {
        let mut a = Map::new();
        a.insert("lat".into(), json!(37.5));
        a.insert("lon".into(), json!(127.0));
        a.insert("radius".into(), json!(500));

        let mut b = Map::new();
        b.insert("radius".into(), json!(500));
        b.insert("lon".into(), json!(127.0));
        b.insert("lat".into(), json!(37.5));

        assert_eq!(
            Fingerprint::new("nearby", "list", &Value::Object(a)),
            Fingerprint::new("nearby", "list", &Value::Object(b))
        );
    }

    #[test]
    fn nested_objects_are_canonicalized() {
        let a = json!({"filter": {"b": 1, "a": 2}, "page": 1});
        let b = json!({"page": 1, "filter": {"a": 2, "b": 1}});
        assert_eq!(
            Fingerprint::new("ns", "op", &a),
            Fingerprint::new("ns", "op", &b)
        );
    }

    #[test]
    fn array_order_is_significant() {
        let a = json!({"ids": [1, 2]});
        let b = json!({"ids": [2, 1]});
        assert_ne!(
            Fingerprint::new("ns", "op", &a),
            Fingerprint::new("ns", "op", &b)
        );
    }

    #[test]
    fn different_values_differ() {
        assert_ne!(
            Fingerprint::new("ns", "op", &json!({"page": 1})),
            Fingerprint::new("ns", "op", &json!({"page": 2}))
        );
        assert_ne!(
            Fingerprint::new("ns", "a", &json!({})),
            Fingerprint::new("ns", "b", &json!({}))
        );
    }

    #[test]
    fn display_is_prefixed_by_namespace_and_operation() {
        let fp = Fingerprint::new("nearby", "list", &json!({"b": 1, "a": 2}));
        assert_eq!(fp.to_string(), r#"nearby:list:{"a":2,"b":1}"#);
    }

    #[test]
    fn scope_matching() {
        let fp = Fingerprint::new("nearby", "list", &json!({}));
        assert!(fp.is_within("nearby", None));
        assert!(fp.is_within("nearby", Some("list")));
        assert!(!fp.is_within("nearby", Some("count")));
        assert!(!fp.is_within("near", None));
    }
}
