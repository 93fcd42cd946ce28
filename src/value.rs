//! Dynamic value model for store state.
//!
//! State is a [`StateMap`]: an ordered map of named [`Value`]s. The model
//! deliberately stays small:
//!
//! - Primitives (`Null`, `Bool`, `Int`, `Float`, `Str`) copy by value
//! - Containers (`List`, `Set`, `Map`) and `Time` copy into fresh instances
//! - `Func` wraps a shared callable and always copies by reference
//!
//! A key present with `Null` is distinct from a missing key; [`ensure`]
//! treats both as absent.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Ordered map of named state fields.
pub type StateMap = BTreeMap<String, Value>;

type MethodFn = dyn Fn(&[Value]) -> Result<Value> + Send + Sync;

/// A named callable operation bound to a store.
///
/// Cheap to copy: copies share the underlying closure.
#[derive(Clone)]
pub struct Method(Arc<MethodFn>);

impl Method {
    /// Wrap a closure as a dispatchable method.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Invoke the method with the given arguments.
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        (self.0)(args)
    }

    fn ptr_eq(&self, other: &Method) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Method(..)")
    }
}

/// A dynamically typed state value.
///
/// `Func` is excluded from serialization; the persist layer strips function
/// values before encoding a snapshot.
#[derive(Debug, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Time(SystemTime),
    List(Vec<Value>),
    /// Insertion-ordered unique elements; use [`Value::set_of`] to build one.
    Set(Vec<Value>),
    Map(StateMap),
    #[serde(skip)]
    Func(Method),
}

impl Value {
    /// Kind of this value, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Time(_) => "time",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
            Value::Func(_) => "func",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&StateMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_func(&self) -> Option<&Method> {
        match self {
            Value::Func(method) => Some(method),
            _ => None,
        }
    }

    pub fn into_map(self) -> Option<StateMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Build a `Set` from the given elements, dropping structural duplicates
    /// and preserving first-insertion order.
    pub fn set_of(items: impl IntoIterator<Item = Value>) -> Value {
        let mut unique: Vec<Value> = Vec::new();
        for item in items {
            if !unique.contains(&item) {
                unique.push(item);
            }
        }
        Value::Set(unique)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Time(a), Value::Time(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Func(a), Value::Func(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl Clone for Value {
    fn clone(&self) -> Self {
        deep_clone(self)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<SystemTime> for Value {
    fn from(t: SystemTime) -> Self {
        Value::Time(t)
    }
}

impl From<Method> for Value {
    fn from(method: Method) -> Self {
        Value::Func(method)
    }
}

/// Recursively copy a value graph.
///
/// The copy shares no mutable container with the original: lists, sets, maps,
/// and time values become fresh instances with copied contents. `Func` values
/// are copied by reference, since a callable is an opaque immutable closure.
/// The value graph is a tree, so there are no cycles to guard against.
pub fn deep_clone(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(b) => Value::Bool(*b),
        Value::Int(n) => Value::Int(*n),
        Value::Float(x) => Value::Float(*x),
        Value::Str(s) => Value::Str(s.clone()),
        Value::Time(t) => Value::Time(*t),
        Value::List(items) => Value::List(items.iter().map(deep_clone).collect()),
        Value::Set(items) => Value::Set(items.iter().map(deep_clone).collect()),
        Value::Map(map) => Value::Map(clone_map(map)),
        Value::Func(method) => Value::Func(method.clone()),
    }
}

/// Deep-copy every entry of a state map.
pub fn clone_map(map: &StateMap) -> StateMap {
    map.iter()
        .map(|(key, value)| (key.clone(), deep_clone(value)))
        .collect()
}

/// Check that every key in `keys` is present on `map` with a non-`Null`
/// value. No side effects; intended for lightweight precondition checks.
pub fn ensure(map: &StateMap, keys: &[&str]) -> bool {
    keys.iter()
        .all(|key| matches!(map.get(*key), Some(value) if !value.is_null()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_state() -> StateMap {
        let mut inner = StateMap::new();
        inner.insert("level".to_string(), Value::Int(3));

        let mut state = StateMap::new();
        state.insert("name".to_string(), Value::from("alice"));
        state.insert(
            "scores".to_string(),
            Value::List(vec![Value::Int(1), Value::Int(2)]),
        );
        state.insert("profile".to_string(), Value::Map(inner));
        state.insert(
            "tags".to_string(),
            Value::set_of(vec![Value::from("a"), Value::from("b")]),
        );
        state.insert(
            "joined".to_string(),
            Value::Time(SystemTime::UNIX_EPOCH + Duration::from_secs(1000)),
        );
        state
    }

    #[test]
    fn test_deep_clone_structural_equality() {
        let state = sample_state();
        let copy = clone_map(&state);
        assert_eq!(state, copy);
    }

    #[test]
    fn test_deep_clone_isolation() {
        let state = sample_state();
        let mut copy = clone_map(&state);

        match copy.get_mut("scores") {
            Some(Value::List(items)) => items.push(Value::Int(3)),
            other => panic!("expected list, got {:?}", other),
        }
        match copy.get_mut("profile") {
            Some(Value::Map(map)) => {
                map.insert("level".to_string(), Value::Int(9));
            }
            other => panic!("expected map, got {:?}", other),
        }

        // Original is untouched in both spots.
        assert_eq!(
            state.get("scores"),
            Some(&Value::List(vec![Value::Int(1), Value::Int(2)]))
        );
        let profile = state.get("profile").and_then(Value::as_map).unwrap();
        assert_eq!(profile.get("level"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_deep_clone_func_by_reference() {
        let method = Method::new(|_args| Ok(Value::Int(7)));
        let original = Value::Func(method);
        let copy = deep_clone(&original);

        // Copies share the closure, so they compare equal by identity.
        assert_eq!(original, copy);
        assert_eq!(copy.as_func().unwrap().call(&[]).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_func_identity_equality() {
        let a = Value::Func(Method::new(|_| Ok(Value::Null)));
        let b = Value::Func(Method::new(|_| Ok(Value::Null)));
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_missing_key_vs_null() {
        let mut state = StateMap::new();
        state.insert("present".to_string(), Value::Null);

        assert!(state.contains_key("present"));
        assert!(!state.contains_key("absent"));

        // Both read as absent through ensure.
        assert!(!ensure(&state, &["present"]));
        assert!(!ensure(&state, &["absent"]));

        // The clone preserves the explicit Null entry.
        let copy = clone_map(&state);
        assert!(copy.contains_key("present"));
        assert_eq!(copy.get("present"), Some(&Value::Null));
    }

    #[test]
    fn test_ensure_truth_table() {
        let mut state = StateMap::new();
        state.insert("a".to_string(), Value::Int(1));
        state.insert("b".to_string(), Value::Int(2));
        assert!(ensure(&state, &["a", "b"]));
        assert!(ensure(&state, &[]));

        state.remove("b");
        assert!(!ensure(&state, &["a", "b"]));
        assert!(ensure(&state, &["a"]));
    }

    #[test]
    fn test_set_of_dedups() {
        let set = Value::set_of(vec![
            Value::Int(1),
            Value::Int(2),
            Value::Int(1),
            Value::from("x"),
        ]);
        assert_eq!(
            set,
            Value::Set(vec![Value::Int(1), Value::Int(2), Value::from("x")])
        );
    }

    #[test]
    fn test_snapshot_round_trip() {
        let state = sample_state();
        let bytes = serde_json::to_vec(&state).unwrap();
        let back: StateMap = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(state, back);
        // Container kinds survive the round trip.
        assert!(matches!(back.get("tags"), Some(Value::Set(_))));
        assert!(matches!(back.get("joined"), Some(Value::Time(_))));
    }

    #[test]
    fn test_func_does_not_serialize() {
        let value = Value::Func(Method::new(|_| Ok(Value::Null)));
        assert!(serde_json::to_vec(&value).is_err());
    }

    #[test]
    fn test_from_conversions() {
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(5i64), Value::Int(5));
        assert_eq!(Value::from(1.5f64), Value::Float(1.5));
        assert_eq!(Value::from("s"), Value::Str("s".to_string()));
        assert_eq!(
            Value::from(SystemTime::UNIX_EPOCH),
            Value::Time(SystemTime::UNIX_EPOCH)
        );
        assert_eq!(Value::from(5i64).type_name(), "int");
    }
}
