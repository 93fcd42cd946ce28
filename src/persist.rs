//! Snapshot persistence for stores.
//!
//! A persisted store loads its state from a [`StorageBackend`] at
//! construction and saves a snapshot on every commit:
//!
//! - the blob is the JSON-encoded [`Persisted`] envelope (schema version +
//!   state), scoped by the store name
//! - function values are stripped before encoding; `partialize` then selects
//!   which fields to keep
//! - restoring fully replaces in-memory state with the persisted snapshot
//! - backend failures surface to the mutating caller unchanged
//!
//! Backends implement load/save/remove over opaque bytes; see
//! [`MemoryBackend`](crate::memory::MemoryBackend) and
//! [`FileBackend`](crate::file::FileBackend).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::store::{create_store, Methods, Store, StoreApi};
use crate::value::{StateMap, Value};

/// A storage medium for persisted snapshots, addressed by store name.
pub trait StorageBackend: Send + Sync {
    /// Load the blob for a store name.
    ///
    /// Returns `None` if nothing has been persisted under this name.
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Save the blob for a store name, replacing any previous one.
    fn save(&self, name: &str, bytes: &[u8]) -> Result<()>;

    /// Delete the blob for a store name, if present.
    fn remove(&self, name: &str) -> Result<()>;
}

/// Selects which fields of a snapshot to persist.
pub type PartializeFn = Arc<dyn Fn(&StateMap) -> StateMap + Send + Sync>;

/// Converts a snapshot persisted at an older schema version.
pub type MigrateFn = Arc<dyn Fn(StateMap, u32) -> Result<StateMap> + Send + Sync>;

/// Hook invoked with the state after a successful hydration.
pub type RehydrateFn = Arc<dyn Fn(&StateMap) + Send + Sync>;

/// Configuration for a persisted store.
#[derive(Clone)]
pub struct PersistOptions {
    name: String,
    storage: Arc<dyn StorageBackend>,
    version: u32,
    partialize: Option<PartializeFn>,
    migrate: Option<MigrateFn>,
    on_rehydrate: Option<RehydrateFn>,
}

impl PersistOptions {
    /// Options for a store persisted under `name` on the given medium.
    pub fn new(name: impl Into<String>, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            name: name.into(),
            storage,
            version: 0,
            partialize: None,
            migrate: None,
            on_rehydrate: None,
        }
    }

    /// Schema version written into every snapshot (default 0).
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Select which fields to persist. Applied after function values are
    /// stripped.
    pub fn partialize<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateMap) -> StateMap + Send + Sync + 'static,
    {
        self.partialize = Some(Arc::new(f));
        self
    }

    /// Convert snapshots persisted at an older version. Receives the decoded
    /// state and the version it was written at.
    pub fn migrate<F>(mut self, f: F) -> Self
    where
        F: Fn(StateMap, u32) -> Result<StateMap> + Send + Sync + 'static,
    {
        self.migrate = Some(Arc::new(f));
        self
    }

    /// Run a hook with the state after a successful hydration.
    pub fn on_rehydrate<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateMap) + Send + Sync + 'static,
    {
        self.on_rehydrate = Some(Arc::new(f));
        self
    }

    /// The storage key this store persists under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The persisted snapshot envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persisted {
    /// Schema version the state was written at.
    pub version: u32,
    /// The persisted state fields.
    pub state: StateMap,
}

/// Validate that a store name is usable as a storage key.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StoreError::Storage("store name cannot be empty".to_string()));
    }
    if name.contains(['/', '\\']) || name.contains("..") {
        return Err(StoreError::Storage(format!(
            "store name must not contain path separators: {name}"
        )));
    }
    Ok(())
}

/// Build a store that hydrates from and saves to a storage backend.
///
/// Construction order: build the store as [`create_store`] does, restore the
/// persisted snapshot if one exists, then start saving on every commit.
/// Hydration itself is not echoed back to storage.
pub fn create_persist_store<F>(
    initial: StateMap,
    factory: F,
    options: PersistOptions,
) -> Result<Store>
where
    F: FnOnce(&StoreApi) -> Methods,
{
    validate_name(&options.name)?;
    let store = create_store(initial, factory);
    hydrate(&store, &options)?;
    install_commit_hook(&store, options);
    Ok(store)
}

fn hydrate(store: &Store, options: &PersistOptions) -> Result<()> {
    let Some(bytes) = options.storage.load(&options.name)? else {
        debug!(name = %options.name, "no persisted snapshot");
        return Ok(());
    };

    let blob: Persisted = serde_json::from_slice(&bytes)?;
    let state = if blob.version == options.version {
        blob.state
    } else {
        match &options.migrate {
            Some(migrate) => migrate(blob.state, blob.version)?,
            None => {
                warn!(
                    name = %options.name,
                    found = blob.version,
                    expected = options.version,
                    "snapshot version mismatch and no migrate configured, skipping hydration"
                );
                return Ok(());
            }
        }
    };

    store.cell().hydrate(state)?;
    info!(name = %options.name, revision = store.revision(), "store hydrated from storage");

    if let Some(hook) = &options.on_rehydrate {
        store.read(|state| hook(state));
    }
    Ok(())
}

fn install_commit_hook(store: &Store, options: PersistOptions) {
    let PersistOptions {
        name,
        storage,
        version,
        partialize,
        ..
    } = options;

    store.cell().set_commit_hook(Box::new(move |state| {
        let stripped = strip_funcs(state);
        let snapshot = match &partialize {
            Some(f) => f(&stripped),
            None => stripped,
        };
        let blob = Persisted {
            version,
            state: snapshot,
        };
        let bytes = serde_json::to_vec(&blob)?;
        storage.save(&name, &bytes)
    }));
}

/// Drop function values from a snapshot before encoding: map entries are
/// removed, list elements become `Null`, set elements are dropped.
fn strip_funcs(state: &StateMap) -> StateMap {
    state
        .iter()
        .filter_map(|(key, value)| scrub(value).map(|v| (key.clone(), v)))
        .collect()
}

fn scrub(value: &Value) -> Option<Value> {
    match value {
        Value::Func(_) => None,
        Value::Map(map) => Some(Value::Map(
            map.iter()
                .filter_map(|(key, v)| scrub(v).map(|v| (key.clone(), v)))
                .collect(),
        )),
        Value::List(items) => Some(Value::List(
            items
                .iter()
                .map(|v| scrub(v).unwrap_or(Value::Null))
                .collect(),
        )),
        Value::Set(items) => Some(Value::Set(items.iter().filter_map(scrub).collect())),
        other => Some(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::store::LAST_UPDATE_KEY;
    use crate::value::Method;

    fn counter_state() -> StateMap {
        let mut state = StateMap::new();
        state.insert("count".to_string(), Value::Int(0));
        state
    }

    fn counter_methods(api: &StoreApi) -> Methods {
        let mut methods = Methods::new();
        let increment_api = api.clone();
        methods.insert(
            "increment".to_string(),
            Method::new(move |_args| {
                increment_api.update(|draft| {
                    let next = draft.get("count").and_then(Value::as_int).unwrap_or(0) + 1;
                    draft.insert("count".to_string(), Value::Int(next));
                    Ok(())
                })?;
                Ok(Value::Null)
            }),
        );
        methods
    }

    struct FailingBackend;

    impl StorageBackend for FailingBackend {
        fn load(&self, _name: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        fn save(&self, _name: &str, _bytes: &[u8]) -> Result<()> {
            Err(StoreError::Storage("medium unavailable".to_string()))
        }

        fn remove(&self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("app-settings").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("..\\evil").is_err());
    }

    #[test]
    fn test_persist_and_reload() {
        let backend = MemoryBackend::new();

        {
            let store = create_persist_store(
                counter_state(),
                counter_methods,
                PersistOptions::new("app", Arc::new(backend.clone())),
            )
            .unwrap();
            store.call("increment", &[]).unwrap();
            store.call("increment", &[]).unwrap();
        }

        // A second store over the same backend sees the persisted state,
        // not the factory initial values.
        let reloaded = create_persist_store(
            counter_state(),
            counter_methods,
            PersistOptions::new("app", Arc::new(backend)),
        )
        .unwrap();

        assert_eq!(
            reloaded.read(|s| s.get("count").cloned()),
            Some(Value::Int(2))
        );
        assert!(reloaded.last_update_time() > 0);
    }

    #[test]
    fn test_hydration_replaces_wholesale() {
        let backend = Arc::new(MemoryBackend::new());
        let mut persisted = StateMap::new();
        persisted.insert("count".to_string(), Value::Int(7));
        persisted.insert(LAST_UPDATE_KEY.to_string(), Value::Int(1234));
        let blob = Persisted {
            version: 0,
            state: persisted,
        };
        backend.save("app", &serde_json::to_vec(&blob).unwrap()).unwrap();

        let mut initial = counter_state();
        initial.insert("extra".to_string(), Value::from("default"));
        let store = create_persist_store(
            initial,
            counter_methods,
            PersistOptions::new("app", backend),
        )
        .unwrap();

        let state = store.get();
        assert_eq!(state.get("count"), Some(&Value::Int(7)));
        assert_eq!(store.last_update_time(), 1234);
        // Full replacement: fields absent from the snapshot are gone.
        assert!(!state.contains_key("extra"));
    }

    #[test]
    fn test_version_mismatch_without_migrate_skips_hydration() {
        let backend = Arc::new(MemoryBackend::new());
        let blob = Persisted {
            version: 1,
            state: counter_state(),
        };
        backend.save("app", &serde_json::to_vec(&blob).unwrap()).unwrap();

        let store = create_persist_store(
            counter_state(),
            counter_methods,
            PersistOptions::new("app", backend).version(2),
        )
        .unwrap();

        // Factory initial state stands.
        assert_eq!(store.revision(), 0);
        assert_eq!(store.last_update_time(), 0);
    }

    #[test]
    fn test_migration_runs_on_version_mismatch() {
        let backend = Arc::new(MemoryBackend::new());
        let mut old = StateMap::new();
        old.insert("counter".to_string(), Value::Int(9));
        let blob = Persisted {
            version: 1,
            state: old,
        };
        backend.save("app", &serde_json::to_vec(&blob).unwrap()).unwrap();

        let store = create_persist_store(
            counter_state(),
            counter_methods,
            PersistOptions::new("app", backend)
                .version(2)
                .migrate(|mut state, from| {
                    assert_eq!(from, 1);
                    // v1 called the field "counter".
                    if let Some(value) = state.remove("counter") {
                        state.insert("count".to_string(), value);
                    }
                    Ok(state)
                }),
        )
        .unwrap();

        assert_eq!(store.read(|s| s.get("count").cloned()), Some(Value::Int(9)));
    }

    #[test]
    fn test_migration_error_propagates() {
        let backend = Arc::new(MemoryBackend::new());
        let blob = Persisted {
            version: 1,
            state: counter_state(),
        };
        backend.save("app", &serde_json::to_vec(&blob).unwrap()).unwrap();

        let result = create_persist_store(
            counter_state(),
            counter_methods,
            PersistOptions::new("app", backend)
                .version(2)
                .migrate(|_state, from| {
                    Err(StoreError::Migration {
                        from,
                        reason: "unsupported".to_string(),
                    })
                }),
        );

        assert!(matches!(result, Err(StoreError::Migration { .. })));
    }

    #[test]
    fn test_partialize_selects_fields() {
        let backend = MemoryBackend::new();

        let store = create_persist_store(
            counter_state(),
            counter_methods,
            PersistOptions::new("app", Arc::new(backend.clone())).partialize(|state| {
                state
                    .iter()
                    .filter(|(key, _)| key.as_str() == "count")
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            }),
        )
        .unwrap();
        store.call("increment", &[]).unwrap();

        let bytes = backend.load("app").unwrap().unwrap();
        let blob: Persisted = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(blob.state.get("count"), Some(&Value::Int(1)));
        assert!(!blob.state.contains_key(LAST_UPDATE_KEY));
    }

    #[test]
    fn test_on_rehydrate_hook_fires() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let backend = Arc::new(MemoryBackend::new());
        let blob = Persisted {
            version: 0,
            state: counter_state(),
        };
        backend.save("app", &serde_json::to_vec(&blob).unwrap()).unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let seen = fired.clone();
        create_persist_store(
            counter_state(),
            counter_methods,
            PersistOptions::new("app", backend).on_rehydrate(move |state| {
                assert!(state.contains_key("count"));
                seen.store(true, Ordering::SeqCst);
            }),
        )
        .unwrap();

        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_save_failure_surfaces_without_rollback() {
        let store = create_persist_store(
            counter_state(),
            counter_methods,
            PersistOptions::new("app", Arc::new(FailingBackend)),
        )
        .unwrap();

        let result = store.call("increment", &[]);
        assert!(matches!(result, Err(StoreError::Storage(_))));
        // The in-memory commit stands.
        assert_eq!(store.read(|s| s.get("count").cloned()), Some(Value::Int(1)));
    }

    #[test]
    fn test_strip_funcs() {
        let mut state = StateMap::new();
        state.insert("op".to_string(), Value::Func(Method::new(|_| Ok(Value::Null))));
        state.insert(
            "list".to_string(),
            Value::List(vec![Value::Int(1), Value::Func(Method::new(|_| Ok(Value::Null)))]),
        );
        state.insert("keep".to_string(), Value::Int(5));

        let stripped = strip_funcs(&state);
        assert!(!stripped.contains_key("op"));
        assert_eq!(stripped.get("keep"), Some(&Value::Int(5)));
        assert_eq!(
            stripped.get("list"),
            Some(&Value::List(vec![Value::Int(1), Value::Null]))
        );
    }

    #[test]
    fn test_bad_name_rejected() {
        let result = create_persist_store(
            counter_state(),
            counter_methods,
            PersistOptions::new("", Arc::new(MemoryBackend::new())),
        );
        assert!(matches!(result, Err(StoreError::Storage(_))));
    }
}
