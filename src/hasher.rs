//! Deterministic hashing of task parameters.
//!
//! Values are first reduced to a canonical JSON form: maps are rebuilt with
//! sorted keys, sets become arrays sorted by their canonical encoding, and
//! sequences keep their order. The canonical bytes are then digested:
//!
//! - SHA-256 for task fingerprints ([`fingerprint`])
//! - git blob ids (SHA-1) for change-detection digests ([`content_digest`]),
//!   the same digest the log uses for its own files
//!
//! Two logically equal values hash the same no matter how their containers
//! were built.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::OnceLock;

use git2::{ObjectType, Oid};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Types that can present a canonical, hashable representation of
/// themselves. Implement this for custom parameter types that need control
/// over what participates in the fingerprint.
pub trait CanonicalHash {
    fn canonical(&self) -> Value;
}

/// Recursively rebuild `value` with sorted object keys.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (key, item) in entries {
                sorted.insert(key.clone(), canonicalize(item));
            }
            Value::Object(sorted)
        }
        other => other.clone(),
    }
}

/// Canonical form of an unordered collection: elements sorted by their
/// canonical encoding, duplicates removed.
pub fn canonical_set<'a, T, I>(items: I) -> Value
where
    T: CanonicalHash + 'a + ?Sized,
    I: IntoIterator<Item = &'a T>,
{
    let encoded: BTreeMap<String, Value> = items
        .into_iter()
        .map(|item| {
            let value = canonicalize(&item.canonical());
            (canonical_string(&value), value)
        })
        .collect();
    Value::Array(encoded.into_values().collect())
}

/// Serde `serialize_with` helper for unordered collections.
///
/// Serde writes a `HashSet` in its iteration order, which differs between
/// two sets holding the same elements. Mark set fields of task parameters
/// with `#[serde(serialize_with = "sak::hasher::sorted_set")]` so they are
/// written sorted by canonical encoding, duplicates removed.
pub fn sorted_set<'a, C, T, S>(items: &'a C, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    &'a C: IntoIterator<Item = &'a T>,
    T: Serialize + 'a,
    S: Serializer,
{
    let mut encoded = BTreeMap::new();
    for item in items {
        let value = serde_json::to_value(item).map_err(serde::ser::Error::custom)?;
        let value = canonicalize(&value);
        encoded.insert(canonical_string(&value), value);
    }
    serializer.collect_seq(encoded.into_values())
}

/// Canonical bytes of an already-canonical value.
fn canonical_string(value: &Value) -> String {
    // Serializing a `Value` cannot fail: keys are always strings.
    serde_json::to_string(value).unwrap_or_default()
}

/// Canonical bytes of any value.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    canonical_string(&canonicalize(value)).into_bytes()
}

/// SHA-256 hex digest of the canonical form of `value`.
pub fn fingerprint(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_bytes(value));
    hex::encode(hasher.finalize())
}

/// Git blob id of raw bytes, as `git hash-object` would compute it.
pub fn blob_digest(bytes: &[u8]) -> Result<String> {
    Ok(Oid::hash_object(ObjectType::Blob, bytes)?.to_string())
}

/// Cheap change-detection digest of the canonical form of `value`.
pub fn content_digest(value: &Value) -> Result<String> {
    blob_digest(&canonical_bytes(value))
}

/// Parameters identifying one task instance.
///
/// The fingerprint is computed on first access and cached; builder methods
/// consume the key, so a key that has been fingerprinted never changes.
#[derive(Debug, Clone, Default)]
pub struct TaskKey {
    data: Map<String, Value>,
    fingerprint: OnceLock<String>,
}

impl TaskKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: Map<String, Value>) -> Self {
        Self {
            data,
            fingerprint: OnceLock::new(),
        }
    }

    /// Build a key from any serializable parameter struct.
    pub fn from_params<P: Serialize>(params: &P) -> Result<Self> {
        match serde_json::to_value(params)? {
            Value::Object(map) => Ok(Self::from_map(map)),
            other => Err(Error::InvalidArgument(format!(
                "task parameters must serialize to an object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Key whose fingerprint is already known (e.g. read back from the log).
    pub fn with_fingerprint(data: Map<String, Value>, fingerprint: impl Into<String>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(fingerprint.into());
        Self {
            data,
            fingerprint: cell,
        }
    }

    /// Add a parameter. Resets any cached fingerprint.
    pub fn with(mut self, name: impl Into<String>, value: impl CanonicalHash) -> Self {
        self.data.insert(name.into(), value.canonical());
        self.fingerprint = OnceLock::new();
        self
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn into_data(self) -> Map<String, Value> {
        self.data
    }

    pub fn fingerprint(&self) -> &str {
        self.fingerprint
            .get_or_init(|| fingerprint(&Value::Object(self.data.clone())))
    }
}

impl PartialEq for TaskKey {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint() == other.fingerprint()
    }
}

impl Eq for TaskKey {}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl CanonicalHash for Value {
    fn canonical(&self) -> Value {
        canonicalize(self)
    }
}

impl<T: CanonicalHash + ?Sized> CanonicalHash for &T {
    fn canonical(&self) -> Value {
        (**self).canonical()
    }
}

macro_rules! canonical_via_json {
    ($($ty:ty),* $(,)?) => {
        $(
            impl CanonicalHash for $ty {
                fn canonical(&self) -> Value {
                    Value::from(self.clone())
                }
            }
        )*
    };
}

canonical_via_json!(bool, i8, i16, i32, i64, u8, u16, u32, u64, usize, isize, f32, f64, String);

impl CanonicalHash for str {
    fn canonical(&self) -> Value {
        Value::String(self.to_string())
    }
}

impl<T: CanonicalHash> CanonicalHash for Option<T> {
    fn canonical(&self) -> Value {
        match self {
            Some(value) => value.canonical(),
            None => Value::Null,
        }
    }
}

impl<T: CanonicalHash> CanonicalHash for [T] {
    fn canonical(&self) -> Value {
        Value::Array(self.iter().map(CanonicalHash::canonical).collect())
    }
}

impl<T: CanonicalHash> CanonicalHash for Vec<T> {
    fn canonical(&self) -> Value {
        self.as_slice().canonical()
    }
}

impl<A: CanonicalHash, B: CanonicalHash> CanonicalHash for (A, B) {
    fn canonical(&self) -> Value {
        Value::Array(vec![self.0.canonical(), self.1.canonical()])
    }
}

impl<A: CanonicalHash, B: CanonicalHash, C: CanonicalHash> CanonicalHash for (A, B, C) {
    fn canonical(&self) -> Value {
        Value::Array(vec![
            self.0.canonical(),
            self.1.canonical(),
            self.2.canonical(),
        ])
    }
}

impl<T: CanonicalHash> CanonicalHash for BTreeMap<String, T> {
    fn canonical(&self) -> Value {
        let map: Map<String, Value> = self
            .iter()
            .map(|(key, value)| (key.clone(), value.canonical()))
            .collect();
        canonicalize(&Value::Object(map))
    }
}

impl<T: CanonicalHash, S> CanonicalHash for HashMap<String, T, S> {
    fn canonical(&self) -> Value {
        let map: Map<String, Value> = self
            .iter()
            .map(|(key, value)| (key.clone(), value.canonical()))
            .collect();
        canonicalize(&Value::Object(map))
    }
}

impl<T: CanonicalHash> CanonicalHash for BTreeSet<T> {
    fn canonical(&self) -> Value {
        canonical_set(self.iter())
    }
}

impl<T: CanonicalHash, S> CanonicalHash for HashSet<T, S> {
    fn canonical(&self) -> Value {
        canonical_set(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insertion_order_does_not_change_fingerprint() {
        let a = TaskKey::new().with("a", 1).with("b", "x");
        let b = TaskKey::new().with("b", "x").with("a", 1);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn nested_maps_are_sorted() {
        let left = json!({"outer": {"z": 1, "a": [1, 2, {"y": true, "b": null}]}});
        let mut inner = Map::new();
        inner.insert("b".to_string(), Value::Null);
        inner.insert("y".to_string(), Value::Bool(true));
        let mut outer = Map::new();
        outer.insert("a".to_string(), json!([1, 2, Value::Object(inner)]));
        outer.insert("z".to_string(), json!(1));
        let mut root = Map::new();
        root.insert("outer".to_string(), Value::Object(outer));

        assert_eq!(fingerprint(&left), fingerprint(&Value::Object(root)));
    }

    #[test]
    fn sequence_order_is_significant() {
        assert_ne!(fingerprint(&json!([1, 2])), fingerprint(&json!([2, 1])));
    }

    #[test]
    fn sets_hash_independent_of_iteration_order() {
        let a: HashSet<String> = ["x", "y", "z"].iter().map(|s| s.to_string()).collect();
        let b: BTreeSet<String> = ["z", "x", "y"].iter().map(|s| s.to_string()).collect();
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(a.canonical(), json!(["x", "y", "z"]));
    }

    #[derive(Serialize)]
    struct Tags {
        #[serde(serialize_with = "sorted_set")]
        tags: HashSet<String>,
    }

    #[test]
    fn sorted_set_fields_serialize_in_canonical_order() {
        let fingerprints: BTreeSet<String> = (0..8)
            .map(|shift| {
                let mut names: Vec<String> = (0..10).map(|i| format!("t{i}")).collect();
                names.rotate_left(shift);
                let key = TaskKey::from_params(&Tags {
                    tags: names.into_iter().collect(),
                })
                .unwrap();
                key.fingerprint().to_string()
            })
            .collect();
        assert_eq!(fingerprints.len(), 1);

        let value = serde_json::to_value(Tags {
            tags: ["b", "a", "c"].iter().map(|s| s.to_string()).collect(),
        })
        .unwrap();
        assert_eq!(value, json!({"tags": ["a", "b", "c"]}));
    }

    #[test]
    fn hash_map_and_btree_map_agree() {
        let mut a = HashMap::new();
        a.insert("k2".to_string(), 2);
        a.insert("k1".to_string(), 1);
        let mut b = BTreeMap::new();
        b.insert("k1".to_string(), 1);
        b.insert("k2".to_string(), 2);

        let key_a = TaskKey::new().with("m", a);
        let key_b = TaskKey::new().with("m", b);
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn preset_fingerprint_is_kept() {
        let key = TaskKey::with_fingerprint(Map::new(), "abc");
        assert_eq!(key.fingerprint(), "abc");
    }

    #[test]
    fn with_resets_cached_fingerprint() {
        let key = TaskKey::new().with("a", 1);
        let first = key.fingerprint().to_string();
        let key = key.with("b", 2);
        assert_ne!(first, key.fingerprint());
    }

    #[test]
    fn from_params_rejects_non_objects() {
        assert!(TaskKey::from_params(&3).is_err());
        let key = TaskKey::from_params(&json!({"b": "x", "a": 1})).unwrap();
        assert_eq!(key, TaskKey::new().with("a", 1).with("b", "x"));
    }

    #[test]
    fn content_digest_matches_git_blob_id() {
        // `printf 'null' | git hash-object --stdin`
        let digest = content_digest(&Value::Null).unwrap();
        assert_eq!(digest, blob_digest(b"null").unwrap());
        assert_eq!(digest.len(), 40);
    }
}
