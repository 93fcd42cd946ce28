//! The state cell and store handle.
//!
//! Core pieces:
//! - [`StateCell`]: a single owned state map behind a lock, with synchronous
//!   merge/replace commits, a commit counter, and change broadcasting
//! - [`StoreApi`]: the cheap cloneable read/mutate accessor pair handed to the
//!   methods factory
//! - [`Store`]: the public handle combining the cell with a named-methods map
//!   and dispatch
//! - [`merged_state`]: the combined "state + methods" view, computed fresh on
//!   every call
//!
//! All operations here run synchronously to completion; `update` is therefore
//! atomic with respect to other synchronous callers, but two methods doing
//! their own async work between commits can still race, exactly as with a
//! plain set/get pair.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::value::{clone_map, Method, StateMap, Value};
use crate::watch::{ChangeEvent, ChangeKind, WatchSender, WatchStream};

/// State field holding the timestamp of the last `update`/`mark_update`,
/// in milliseconds since the Unix epoch. Starts at 0.
pub const LAST_UPDATE_KEY: &str = "last_update_time";

/// Named operations bound to a store.
pub type Methods = BTreeMap<String, Method>;

/// Observer invoked after every in-memory commit, with the new snapshot.
/// Its error is returned to the mutating caller; the commit is not rolled
/// back.
pub(crate) type CommitHook = Box<dyn Fn(&StateMap) -> Result<()> + Send + Sync>;

struct CellInner {
    state: StateMap,
    revision: u64,
}

/// A single owned state cell with synchronous read and replace operations.
///
/// Higher layers (method dispatch, persistence) are decorators over this
/// cell; the cell itself only stores, diffs, and notifies.
pub struct StateCell {
    inner: RwLock<CellInner>,
    hook: RwLock<Option<CommitHook>>,
    watcher: WatchSender,
}

impl StateCell {
    /// Create a cell seeded with the given state.
    ///
    /// The `last_update_time` field is added with value 0 when absent.
    pub fn new(mut initial: StateMap) -> Self {
        initial
            .entry(LAST_UPDATE_KEY.to_string())
            .or_insert(Value::Int(0));
        Self {
            inner: RwLock::new(CellInner {
                state: initial,
                revision: 0,
            }),
            hook: RwLock::new(None),
            watcher: WatchSender::default(),
        }
    }

    /// Deep-cloned snapshot of the full current state.
    pub fn get(&self) -> StateMap {
        self.read(clone_map)
    }

    /// Borrow the current state without cloning.
    pub fn read<R>(&self, f: impl FnOnce(&StateMap) -> R) -> R {
        f(&self.inner.read().state)
    }

    /// Commit counter; bumped once per successful commit.
    pub fn revision(&self) -> u64 {
        self.inner.read().revision
    }

    /// Timestamp of the last update, 0 when the field is absent.
    pub fn last_update_time(&self) -> i64 {
        self.read(|state| match state.get(LAST_UPDATE_KEY) {
            Some(Value::Int(ms)) => *ms,
            _ => 0,
        })
    }

    /// Merge the fields of `partial` over the current state.
    pub fn set(&self, partial: StateMap) -> Result<()> {
        self.commit(partial, ChangeKind::Merged)
    }

    /// Replace the whole state with `next`.
    ///
    /// Installs exactly the given map: `last_update_time` is neither
    /// preserved from the old state nor refreshed.
    pub fn replace(&self, next: StateMap) -> Result<()> {
        self.commit(next, ChangeKind::Replaced)
    }

    pub(crate) fn hydrate(&self, snapshot: StateMap) -> Result<()> {
        self.commit(snapshot, ChangeKind::Hydrated)
    }

    /// Clone the current state, let `mutator` edit the draft in place, then
    /// commit the draft with a refreshed `last_update_time`.
    ///
    /// The previous state is never touched by the mutator. If the mutator
    /// fails, its error propagates and nothing is committed.
    pub fn update<F>(&self, mutator: F) -> Result<()>
    where
        F: FnOnce(&mut StateMap) -> Result<()>,
    {
        let mut draft = self.get();
        mutator(&mut draft)?;
        draft.insert(LAST_UPDATE_KEY.to_string(), Value::Int(self.next_timestamp()));
        self.set(draft)
    }

    /// Refresh `last_update_time`, leaving every other field untouched.
    pub fn mark_update(&self) -> Result<()> {
        let mut patch = StateMap::new();
        patch.insert(LAST_UPDATE_KEY.to_string(), Value::Int(self.next_timestamp()));
        self.set(patch)
    }

    /// Subscribe to commits matching a field pattern (see [`WatchStream`]).
    pub fn watch(&self, pattern: &str) -> WatchStream {
        self.watcher.subscribe(pattern)
    }

    pub(crate) fn set_commit_hook(&self, hook: CommitHook) {
        *self.hook.write() = Some(hook);
    }

    /// Next timestamp, clamped so the field never decreases even if the wall
    /// clock steps backwards. Ties are possible at clock resolution.
    fn next_timestamp(&self) -> i64 {
        now_ms().max(self.last_update_time())
    }

    fn commit(&self, incoming: StateMap, kind: ChangeKind) -> Result<()> {
        let (snapshot, fields, revision) = {
            let mut inner = self.inner.write();
            let fields = match kind {
                ChangeKind::Merged => apply_merge(&mut inner.state, incoming),
                ChangeKind::Replaced | ChangeKind::Hydrated => {
                    apply_replace(&mut inner.state, incoming)
                }
            };
            inner.revision += 1;
            (clone_map(&inner.state), fields, inner.revision)
        };

        debug!(revision, ?kind, changed = fields.len(), "state committed");
        self.watcher.send(ChangeEvent {
            kind,
            fields,
            state: clone_map(&snapshot),
            revision,
        });

        let hook = self.hook.read();
        if let Some(hook) = hook.as_ref() {
            hook(&snapshot)?;
        }
        Ok(())
    }
}

fn apply_merge(state: &mut StateMap, incoming: StateMap) -> Vec<String> {
    let mut changed = Vec::new();
    for (key, value) in incoming {
        if state.get(&key) != Some(&value) {
            changed.push(key.clone());
        }
        state.insert(key, value);
    }
    changed
}

fn apply_replace(state: &mut StateMap, incoming: StateMap) -> Vec<String> {
    let mut changed: Vec<String> = state
        .keys()
        .filter(|key| !incoming.contains_key(*key))
        .cloned()
        .collect();
    for (key, value) in &incoming {
        if state.get(key) != Some(value) {
            changed.push(key.clone());
        }
    }
    *state = incoming;
    changed
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The native read/mutate accessors over a cell.
///
/// This is what the methods factory receives; methods close over a clone of
/// it. Cloning is cheap and every clone addresses the same cell.
#[derive(Clone)]
pub struct StoreApi {
    cell: Arc<StateCell>,
}

impl StoreApi {
    /// Deep-cloned snapshot of the full current state.
    pub fn get(&self) -> StateMap {
        self.cell.get()
    }

    /// Borrow the current state without cloning.
    pub fn read<R>(&self, f: impl FnOnce(&StateMap) -> R) -> R {
        self.cell.read(f)
    }

    /// Merge the fields of `partial` over the current state.
    pub fn set(&self, partial: StateMap) -> Result<()> {
        self.cell.set(partial)
    }

    /// Replace the whole state with `next`.
    pub fn replace(&self, next: StateMap) -> Result<()> {
        self.cell.replace(next)
    }

    /// Clone-mutate-commit; see [`StateCell::update`].
    pub fn update<F>(&self, mutator: F) -> Result<()>
    where
        F: FnOnce(&mut StateMap) -> Result<()>,
    {
        self.cell.update(mutator)
    }

    /// Refresh `last_update_time` only.
    pub fn mark_update(&self) -> Result<()> {
        self.cell.mark_update()
    }

    /// Timestamp of the last update.
    pub fn last_update_time(&self) -> i64 {
        self.cell.last_update_time()
    }

    /// Commit counter.
    pub fn revision(&self) -> u64 {
        self.cell.revision()
    }

    /// Subscribe to commits matching a field pattern.
    pub fn watch(&self, pattern: &str) -> WatchStream {
        self.cell.watch(pattern)
    }
}

/// A store: the state cell plus its named operations.
pub struct Store {
    api: StoreApi,
    methods: Methods,
}

/// Build a store from an initial state and a methods factory.
///
/// The factory runs exactly once, synchronously, receiving the native
/// accessors. `update` and `mark_update` entries are then injected into the
/// returned map unconditionally, overriding user entries with those names.
pub fn create_store<F>(initial: StateMap, factory: F) -> Store
where
    F: FnOnce(&StoreApi) -> Methods,
{
    let api = StoreApi {
        cell: Arc::new(StateCell::new(initial)),
    };
    let mut methods = factory(&api);
    inject_builtin_methods(&mut methods, &api);
    Store { api, methods }
}

fn inject_builtin_methods(methods: &mut Methods, api: &StoreApi) {
    let update_api = api.clone();
    methods.insert(
        "update".to_string(),
        Method::new(move |args| {
            let mutator = match args.first() {
                Some(Value::Func(method)) => method.clone(),
                other => {
                    return Err(StoreError::TypeMismatch {
                        expected: "func",
                        found: other.map(Value::type_name).unwrap_or("nothing"),
                    })
                }
            };
            update_api.update(|draft| {
                let result = mutator.call(&[Value::Map(std::mem::take(draft))])?;
                match result {
                    Value::Map(next) => {
                        *draft = next;
                        Ok(())
                    }
                    other => Err(StoreError::TypeMismatch {
                        expected: "map",
                        found: other.type_name(),
                    }),
                }
            })?;
            Ok(Value::Null)
        }),
    );

    let mark_api = api.clone();
    methods.insert(
        "mark_update".to_string(),
        Method::new(move |_args| {
            mark_api.mark_update()?;
            Ok(Value::Null)
        }),
    );
}

impl Store {
    /// The native accessors of this store.
    pub fn api(&self) -> &StoreApi {
        &self.api
    }

    /// The methods map, injected entries included.
    pub fn methods(&self) -> &Methods {
        &self.methods
    }

    /// Invoke a named method.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        let method = self
            .methods
            .get(name)
            .ok_or_else(|| StoreError::UnknownMethod(name.to_string()))?;
        method.call(args)
    }

    /// Combined "state + methods" view; see [`merged_state`].
    pub fn merged(&self) -> StateMap {
        let api = self.api.clone();
        merged_state(move || api.get(), &self.methods)
    }

    /// Deep-cloned snapshot of the full current state.
    pub fn get(&self) -> StateMap {
        self.api.get()
    }

    /// Borrow the current state without cloning.
    pub fn read<R>(&self, f: impl FnOnce(&StateMap) -> R) -> R {
        self.api.read(f)
    }

    /// Merge the fields of `partial` over the current state.
    pub fn set(&self, partial: StateMap) -> Result<()> {
        self.api.set(partial)
    }

    /// Replace the whole state with `next`.
    pub fn replace(&self, next: StateMap) -> Result<()> {
        self.api.replace(next)
    }

    /// Clone-mutate-commit; see [`StateCell::update`].
    pub fn update<F>(&self, mutator: F) -> Result<()>
    where
        F: FnOnce(&mut StateMap) -> Result<()>,
    {
        self.api.update(mutator)
    }

    /// Refresh `last_update_time` only.
    pub fn mark_update(&self) -> Result<()> {
        self.api.mark_update()
    }

    /// Timestamp of the last update.
    pub fn last_update_time(&self) -> i64 {
        self.api.last_update_time()
    }

    /// Commit counter.
    pub fn revision(&self) -> u64 {
        self.api.revision()
    }

    /// Subscribe to commits matching a field pattern.
    pub fn watch(&self, pattern: &str) -> WatchStream {
        self.api.watch(pattern)
    }

    pub(crate) fn cell(&self) -> &Arc<StateCell> {
        &self.api.cell
    }
}

/// Combined view of the current state plus all methods as `Func` entries,
/// with methods taking precedence on name collision.
///
/// Computed fresh on every invocation, so it always reflects the state
/// snapshot at call time. A method body can fetch a sibling `Func` out of
/// this view and call it.
pub fn merged_state<G>(get_state: G, methods: &Methods) -> StateMap
where
    G: Fn() -> StateMap,
{
    let mut merged = get_state();
    for (name, method) in methods {
        merged.insert(name.clone(), Value::Func(method.clone()));
    }
    merged
}
