//! # storekit
//!
//! Snapshot-based state store with method dispatch, clone-on-write updates,
//! and pluggable persistence.
//!
//! A store holds a dynamic map of named [`Value`]s plus a map of named
//! operations closed over the store's accessors. On top of a plain set/get
//! pair it adds:
//!
//! - **Clone-on-write updates**: `update(mutator)` deep-clones the current
//!   state, lets the mutator edit the draft in place, and commits the draft
//!   atomically - or not at all if the mutator fails
//! - **Update bookkeeping**: a `last_update_time` field stamped on every
//!   `update`/`mark_update`, monotonically non-decreasing
//! - **Method dispatch**: named operations invokable through the store
//!   handle, with a merged "state + methods" view for sibling calls
//! - **Change notifications**: every commit broadcasts the changed fields to
//!   pattern-filtered subscribers
//! - **Persistence**: snapshots saved on every commit and restored at
//!   startup, with versioning, migration, and field selection
//!
//! ## Backends
//!
//! - [`FileBackend`]: atomic-write JSON files (durable)
//! - [`MemoryBackend`]: in-process blobs (testing and development)
//!
//! ## Quick Start
//!
//! ```rust
//! use storekit::{create_store, Method, Methods, StateMap, Value};
//!
//! let mut initial = StateMap::new();
//! initial.insert("count".to_string(), Value::Int(0));
//!
//! let store = create_store(initial, |api| {
//!     let mut methods = Methods::new();
//!     let counter = api.clone();
//!     methods.insert(
//!         "increment".to_string(),
//!         Method::new(move |_args| {
//!             counter.update(|draft| {
//!                 let next = draft.get("count").and_then(Value::as_int).unwrap_or(0) + 1;
//!                 draft.insert("count".to_string(), Value::Int(next));
//!                 Ok(())
//!             })?;
//!             Ok(Value::Null)
//!         }),
//!     );
//!     methods
//! });
//!
//! store.call("increment", &[])?;
//! store.call("increment", &[])?;
//! store.call("increment", &[])?;
//!
//! assert_eq!(store.read(|s| s.get("count").cloned()), Some(Value::Int(3)));
//! assert!(store.last_update_time() > 0);
//! # Ok::<(), storekit::StoreError>(())
//! ```
//!
//! ## Persistence
//!
//! ```rust
//! use std::sync::Arc;
//! use storekit::{
//!     create_persist_store, MemoryBackend, Methods, PersistOptions, StateMap, Value,
//! };
//!
//! let backend = MemoryBackend::new();
//! let mut initial = StateMap::new();
//! initial.insert("theme".to_string(), Value::from("dark"));
//!
//! let store = create_persist_store(
//!     initial.clone(),
//!     |_api| Methods::new(),
//!     PersistOptions::new("settings", Arc::new(backend.clone())),
//! )?;
//! store.update(|draft| {
//!     draft.insert("theme".to_string(), Value::from("light"));
//!     Ok(())
//! })?;
//!
//! // A later session restores the persisted snapshot.
//! let restored = create_persist_store(
//!     initial,
//!     |_api| Methods::new(),
//!     PersistOptions::new("settings", Arc::new(backend)),
//! )?;
//! assert_eq!(
//!     restored.read(|s| s.get("theme").cloned()),
//!     Some(Value::from("light"))
//! );
//! # Ok::<(), storekit::StoreError>(())
//! ```

pub mod error;
pub mod file;
pub mod memory;
pub mod persist;
pub mod store;
pub mod value;
pub mod watch;

pub use error::{Result, StoreError};
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use persist::{
    create_persist_store, MigrateFn, PartializeFn, Persisted, PersistOptions, RehydrateFn,
    StorageBackend,
};
pub use store::{
    create_store, merged_state, Methods, StateCell, Store, StoreApi, LAST_UPDATE_KEY,
};
pub use value::{clone_map, deep_clone, ensure, Method, StateMap, Value};
pub use watch::{ChangeEvent, ChangeKind, WatchSender, WatchStream};
