//! Actor state persistence.
//!
//! State is owned by exactly one actor instance and flows through a pluggable
//! [`StateStore`] as opaque bytes (JSON in practice). The runtime loads on
//! initialize, saves after each command behind the `state_save` breaker.
//!
//! # Container encoding
//!
//! Keyed mappings and sets are persisted with an explicit discriminator
//! instead of being guessed from property names:
//!
//! ```json
//! {"__type": "map", "entries": [["u1", {...}], ["u2", {...}]]}
//! {"__type": "set", "items": ["a", "b"]}
//! ```
//!
//! [`KeyedMap`] and [`TaggedSet`] write this form and read both it and the
//! plain legacy form. When a persisted state fails its schema,
//! [`conversion_hints`] points at untagged objects sitting where a mapping is
//! expected.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::schema::FieldError;

// =============================================================================
// State Store
// =============================================================================

/// Byte-level persistence for actor state.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Persisted bytes for an actor, `None` for a fresh instance.
    async fn load(&self, actor_id: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Replace the persisted bytes for an actor.
    async fn save(&self, actor_id: &str, bytes: &[u8]) -> anyhow::Result<()>;
}

/// Process-local state store. `set_failing(true)` simulates an outage.
#[derive(Default)]
pub struct InMemoryStateStore {
    states: DashMap<String, Vec<u8>>,
    failing: AtomicBool,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Seed a state directly (test setup).
    pub fn put(&self, actor_id: &str, bytes: Vec<u8>) {
        self.states.insert(actor_id.to_string(), bytes);
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, actor_id: &str) -> anyhow::Result<Option<Vec<u8>>> {
        if self.failing.load(Ordering::Acquire) {
            anyhow::bail!("state store unavailable");
        }
        Ok(self.states.get(actor_id).map(|b| b.value().clone()))
    }

    async fn save(&self, actor_id: &str, bytes: &[u8]) -> anyhow::Result<()> {
        if self.failing.load(Ordering::Acquire) {
            anyhow::bail!("state store unavailable");
        }
        self.states.insert(actor_id.to_string(), bytes.to_vec());
        Ok(())
    }
}

// =============================================================================
// Keyed Map
// =============================================================================

/// A keyed mapping with an explicit persistence discriminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedMap<V>(pub BTreeMap<String, V>);

impl<V> KeyedMap<V> {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }
}

impl<V> Default for KeyedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Deref for KeyedMap<V> {
    type Target = BTreeMap<String, V>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<V> DerefMut for KeyedMap<V> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<V> FromIterator<(String, V)> for KeyedMap<V> {
    fn from_iter<I: IntoIterator<Item = (String, V)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<V: Serialize> Serialize for KeyedMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("__type", "map")?;
        let entries: Vec<(&String, &V)> = self.0.iter().collect();
        map.serialize_entry("entries", &entries)?;
        map.end()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for KeyedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr<V> {
            Tagged {
                #[serde(rename = "__type")]
                tag: String,
                entries: Vec<(String, V)>,
            },
            Plain(BTreeMap<String, V>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Tagged { tag, entries } if tag == "map" => {
                Ok(Self(entries.into_iter().collect()))
            }
            Repr::Tagged { tag, .. } => Err(serde::de::Error::custom(format!(
                "unexpected container tag {tag:?}, expected \"map\""
            ))),
            Repr::Plain(map) => Ok(Self(map)),
        }
    }
}

// =============================================================================
// Tagged Set
// =============================================================================

/// A set with an explicit persistence discriminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedSet<T: Ord>(pub BTreeSet<T>);

impl<T: Ord> TaggedSet<T> {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }
}

impl<T: Ord> Default for TaggedSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord> Deref for TaggedSet<T> {
    type Target = BTreeSet<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: Ord> DerefMut for TaggedSet<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T: Ord> FromIterator<T> for TaggedSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<T: Ord + Serialize> Serialize for TaggedSet<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("__type", "set")?;
        let items: Vec<&T> = self.0.iter().collect();
        map.serialize_entry("items", &items)?;
        map.end()
    }
}

impl<'de, T: Ord + Deserialize<'de>> Deserialize<'de> for TaggedSet<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr<T: Ord> {
            Tagged {
                #[serde(rename = "__type")]
                tag: String,
                items: Vec<T>,
            },
            Plain(Vec<T>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Tagged { tag, items } if tag == "set" => Ok(Self(items.into_iter().collect())),
            Repr::Tagged { tag, .. } => Err(serde::de::Error::custom(format!(
                "unexpected container tag {tag:?}, expected \"set\""
            ))),
            Repr::Plain(items) => Ok(Self(items.into_iter().collect())),
        }
    }
}

// =============================================================================
// Conversion Hints
// =============================================================================

/// For each schema error whose offending value is an untagged object, suggest
/// the tagged-container conversion. Used to enrich `STATE_VALIDATION_FAILED`.
///
/// A missing-required error points at the absent field; the untagged object
/// sits at its parent, so the parent path is checked when the exact path
/// resolves to nothing.
pub fn conversion_hints(errors: &[FieldError], state: &Value) -> Vec<String> {
    let mut hints = std::collections::BTreeSet::new();
    for err in errors {
        let candidate = match lookup_path(state, &err.path) {
            Some(value) => Some((err.path.as_str(), value)),
            None => parent_path(&err.path)
                .and_then(|parent| lookup_path(state, parent).map(|v| (parent, v))),
        };
        let Some((path, value)) = candidate else {
            continue;
        };
        let Some(obj) = value.as_object() else {
            continue;
        };
        if !obj.contains_key("__type") {
            hints.insert(format!(
                "convert object at '{}' to a keyed mapping ({{\"__type\":\"map\",\"entries\":[...]}})",
                if path.is_empty() { "<root>" } else { path }
            ));
        }
    }
    hints.into_iter().collect()
}

fn parent_path(path: &str) -> Option<&str> {
    path.rsplit_once('.').map(|(parent, _)| parent)
}

fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        // Array indices look like name[3].
        let (name, index) = match segment.split_once('[') {
            Some((name, rest)) => {
                let index: usize = rest.strip_suffix(']')?.parse().ok()?;
                (name, Some(index))
            }
            None => (segment, None),
        };
        if !name.is_empty() {
            current = current.get(name)?;
        }
        if let Some(index) = index {
            current = current.get(index)?;
        }
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_state_store_round_trip() {
        let store = InMemoryStateStore::new();
        assert!(store.load("auth-1").await.unwrap().is_none());

        store.save("auth-1", b"{\"n\":1}").await.unwrap();
        assert_eq!(store.load("auth-1").await.unwrap().unwrap(), b"{\"n\":1}");

        store.set_failing(true);
        assert!(store.load("auth-1").await.is_err());
        assert!(store.save("auth-1", b"x").await.is_err());
    }

    #[test]
    fn test_keyed_map_serializes_tagged() {
        let map: KeyedMap<i32> = [("a".to_string(), 1), ("b".to_string(), 2)]
            .into_iter()
            .collect();
        let v = serde_json::to_value(&map).unwrap();
        assert_eq!(v["__type"], "map");
        assert_eq!(v["entries"], json!([["a", 1], ["b", 2]]));
    }

    #[test]
    fn test_keyed_map_reads_tagged_and_plain() {
        let tagged: KeyedMap<i32> =
            serde_json::from_value(json!({"__type": "map", "entries": [["a", 1]]})).unwrap();
        assert_eq!(tagged.get("a"), Some(&1));

        // Legacy plain-object form still reads.
        let plain: KeyedMap<i32> = serde_json::from_value(json!({"a": 1, "b": 2})).unwrap();
        assert_eq!(plain.len(), 2);
    }

    #[test]
    fn test_keyed_map_rejects_wrong_tag() {
        let result: Result<KeyedMap<i32>, _> =
            serde_json::from_value(json!({"__type": "set", "entries": []}));
        assert!(result.is_err());
    }

    #[test]
    fn test_keyed_map_round_trip_with_struct_values() {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct Session {
            user_id: String,
            active: bool,
        }

        let mut map: KeyedMap<Session> = KeyedMap::new();
        map.insert(
            "s1".into(),
            Session {
                user_id: "u1".into(),
                active: true,
            },
        );

        let bytes = serde_json::to_vec(&map).unwrap();
        let back: KeyedMap<Session> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_tagged_set_round_trip() {
        let set: TaggedSet<String> = ["b".to_string(), "a".to_string()].into_iter().collect();
        let v = serde_json::to_value(&set).unwrap();
        assert_eq!(v["__type"], "set");
        assert_eq!(v["items"], json!(["a", "b"]));

        let back: TaggedSet<String> = serde_json::from_value(v).unwrap();
        assert_eq!(back, set);

        let plain: TaggedSet<i32> = serde_json::from_value(json!([3, 1, 2])).unwrap();
        assert_eq!(plain.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_conversion_hints_flags_untagged_objects() {
        let state = json!({
            "sessions": {"s1": {"user": "u1"}},
            "count": 3
        });
        let errors = vec![FieldError {
            path: "sessions".into(),
            message: "expected tagged container".into(),
            expected: None,
            received: None,
        }];

        let hints = conversion_hints(&errors, &state);
        assert_eq!(hints.len(), 1);
        assert!(hints[0].contains("sessions"));
        assert!(hints[0].contains("keyed mapping"));
    }

    #[test]
    fn test_conversion_hints_skips_tagged_and_non_objects() {
        let state = json!({
            "tagged": {"__type": "map", "entries": []},
            "number": 7
        });
        let errors = vec![
            FieldError {
                path: "tagged".into(),
                message: "x".into(),
                expected: None,
                received: None,
            },
            FieldError {
                path: "number".into(),
                message: "x".into(),
                expected: None,
                received: None,
            },
        ];
        assert!(conversion_hints(&errors, &state).is_empty());
    }

    #[test]
    fn test_lookup_path_arrays() {
        let state = json!({"items": [{"sku": "a"}, {"sku": {"nested": true}}]});
        let errors = vec![FieldError {
            path: "items[1].sku".into(),
            message: "x".into(),
            expected: None,
            received: None,
        }];
        let hints = conversion_hints(&errors, &state);
        assert_eq!(hints.len(), 1);
        assert!(hints[0].contains("items[1].sku"));
    }
}
