// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed access to a field table.

use std::collections::HashMap;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::ThreadId;

use super::owner::{Owner, OwnerKey};
use super::provider::{FieldKind, field_provider};
use super::table::{EntryKey, ErasedValue, FieldTable};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Opened once the initializing caller for an owner is done, successfully or not.
struct InitLatch {
    initializer: ThreadId,
    done: Mutex<bool>,
    opened: Condvar,
}

impl InitLatch {
    fn new() -> Self {
        InitLatch {
            initializer: std::thread::current().id(),
            done: Mutex::new(false),
            opened: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut done = lock(&self.done);
        while !*done {
            done = self
                .opened
                .wait(done)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn open(&self) {
        *lock(&self.done) = true;
        self.opened.notify_all();
    }
}

enum Claim {
    /// The caller must run the supplier.
    Owned(Arc<InitLatch>),
    /// Another caller is running the supplier.
    Wait(Arc<InitLatch>),
    /// The supplier is re-entering initialization of its own owner.
    Reentrant,
}

/// Table plus in-flight initializations for one field.
pub(crate) struct FieldState {
    kind: FieldKind,
    table: Arc<dyn FieldTable>,
    pending: Mutex<HashMap<OwnerKey, Arc<InitLatch>>>,
}

impl FieldState {
    fn new(kind: FieldKind, table: Arc<dyn FieldTable>) -> Self {
        FieldState {
            kind,
            table,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Only touches the pending map. The table (and any owner liveness check) is
    /// consulted by the caller after the lock is gone.
    fn claim(&self, key: OwnerKey) -> Claim {
        let mut pending = lock(&self.pending);
        if let Some(latch) = pending.get(&key) {
            if latch.initializer == std::thread::current().id() {
                return Claim::Reentrant;
            }
            return Claim::Wait(latch.clone());
        }
        let latch = Arc::new(InitLatch::new());
        pending.insert(key, latch.clone());
        Claim::Owned(latch)
    }
}

/// Releases an initialization claim on every exit path, including a panicking supplier.
struct PendingInit<'a> {
    state: &'a FieldState,
    key: OwnerKey,
    latch: Arc<InitLatch>,
}

impl Drop for PendingInit<'_> {
    fn drop(&mut self) {
        {
            let mut pending = lock(&self.state.pending);
            if pending
                .get(&self.key)
                .is_some_and(|latch| Arc::ptr_eq(latch, &self.latch))
            {
                pending.remove(&self.key);
            }
        }
        self.latch.open();
    }
}

static REGISTRY: OnceLock<Mutex<HashMap<FieldKind, Arc<FieldState>>>> = OnceLock::new();

fn shared_state(kind: FieldKind) -> Arc<FieldState> {
    let registry = REGISTRY.get_or_init(Default::default);
    lock(registry)
        .entry(kind)
        .or_insert_with(|| {
            let provider = field_provider();
            logwise::debuginternal_sync!(
                "Creating {provider} table for field {owner} -> {value}",
                provider = provider.name(),
                owner = kind.owner_type_name(),
                value = kind.value_type_name()
            );
            Arc::new(FieldState::new(kind, provider.create_table(kind)))
        })
        .clone()
}

/// A value of type `V` attached to owners of type `O` without modifying `O`.
///
/// A `VirtualField` behaves like an extra field on every `O`, stored out of line in
/// a weak-keyed side table. Attaching a value never keeps the owner alive; once the
/// owner is dropped its entry becomes invisible and is expunged.
///
/// Handles are cheap to clone. Every handle returned by [`VirtualField::find`] for
/// the same `(O, V)` pair shares one table.
///
/// # Examples
///
/// ```rust
/// use carrywise::field::VirtualField;
/// use std::sync::Arc;
///
/// struct Connection;
///
/// let retries = VirtualField::<Arc<Connection>, u32>::find();
/// let conn = Arc::new(Connection);
///
/// assert_eq!(retries.get(&conn), None);
/// retries.put(&conn, 3);
/// assert_eq!(retries.get(&conn), Some(3));
///
/// let n = retries.compute_if_absent(&conn, || 0);
/// assert_eq!(n, 3);
/// ```
pub struct VirtualField<O, V> {
    state: Arc<FieldState>,
    _marker: PhantomData<fn(&O) -> V>,
}

impl<O, V> Clone for VirtualField<O, V> {
    fn clone(&self) -> Self {
        VirtualField {
            state: self.state.clone(),
            _marker: PhantomData,
        }
    }
}

impl<O, V> std::fmt::Debug for VirtualField<O, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualField")
            .field("owner", &self.state.kind.owner_type_name())
            .field("value", &self.state.kind.value_type_name())
            .finish()
    }
}

impl<O, V> VirtualField<O, V>
where
    O: Owner + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// The process-wide field for `(O, V)`, backed by the installed provider.
    pub fn find() -> Self {
        VirtualField {
            state: shared_state(FieldKind::of::<O, V>()),
            _marker: PhantomData,
        }
    }

    /// A field private to this handle (and its clones), backed by `table`.
    pub fn with_table(table: Arc<dyn FieldTable>) -> Self {
        VirtualField {
            state: Arc::new(FieldState::new(FieldKind::of::<O, V>(), table)),
            _marker: PhantomData,
        }
    }

    /// The kind this field stores.
    pub fn kind(&self) -> FieldKind {
        self.state.kind
    }

    fn decode(value: ErasedValue) -> Option<V> {
        value.downcast_ref::<V>().cloned()
    }

    fn encode(value: V) -> ErasedValue {
        Arc::new(value)
    }

    fn entry(&self, owner: OwnerKey) -> EntryKey {
        EntryKey::new(self.state.kind, owner)
    }

    fn get_key(&self, key: OwnerKey) -> Option<V> {
        self.state.table.get(self.entry(key)).and_then(Self::decode)
    }

    fn put_key(&self, key: OwnerKey, owner: &O, value: V) -> Option<V> {
        self.state
            .table
            .put(self.entry(key), owner.liveness(), Self::encode(value))
            .and_then(Self::decode)
    }

    /// Holds the initialization claim for `key`, waiting out any other holder.
    ///
    /// `None` means this thread already holds it further up the stack.
    fn acquire(&self, key: OwnerKey) -> Option<PendingInit<'_>> {
        loop {
            match self.state.claim(key) {
                Claim::Owned(latch) => {
                    return Some(PendingInit {
                        state: &self.state,
                        key,
                        latch,
                    });
                }
                Claim::Wait(latch) => latch.wait(),
                Claim::Reentrant => return None,
            }
        }
    }

    /// The value attached to `owner`.
    pub fn get(&self, owner: &O) -> Option<V> {
        self.get_key(owner.owner_key())
    }

    /// Attaches `value` to `owner`, returning the value it replaced.
    pub fn put(&self, owner: &O, value: V) -> Option<V> {
        self.put_key(owner.owner_key(), owner, value)
    }

    /// Attaches `value` unless `owner` already has one.
    ///
    /// Returns the existing value when there was one (and `value` was not stored).
    pub fn put_if_absent(&self, owner: &O, value: V) -> Option<V> {
        self.state
            .table
            .put_if_absent(
                self.entry(owner.owner_key()),
                owner.liveness(),
                Self::encode(value),
            )
            .and_then(Self::decode)
    }

    /// Returns the value attached to `owner`, creating it with `supplier` if needed.
    ///
    /// Concurrent first calls for the same owner run `supplier` once; every caller
    /// gets the same value. No table lock is held while `supplier` runs; callers
    /// racing on the same owner wait for it instead. If `supplier` panics, nothing is
    /// stored and a waiting caller takes over.
    ///
    /// A supplier that re-enters this method for the same owner runs its inner
    /// supplier unstored, so the outer value is the one that sticks.
    pub fn compute_if_absent(&self, owner: &O, supplier: impl FnOnce() -> V) -> V {
        match self.try_compute_if_absent(owner, || Ok::<V, Infallible>(supplier())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Like [`compute_if_absent`](Self::compute_if_absent) with a fallible supplier.
    ///
    /// An error is returned to the caller unchanged and nothing is stored, so the
    /// next call runs a supplier again.
    pub fn try_compute_if_absent<E>(
        &self,
        owner: &O,
        supplier: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        let key = owner.owner_key();
        let _pending = loop {
            if let Some(value) = self.get_key(key) {
                return Ok(value);
            }
            match self.state.claim(key) {
                Claim::Owned(latch) => {
                    break PendingInit {
                        state: &self.state,
                        key,
                        latch,
                    };
                }
                Claim::Wait(latch) => latch.wait(),
                Claim::Reentrant => return supplier(),
            }
        };
        // a caller that finished between our lookup and our claim left its value
        if let Some(value) = self.get_key(key) {
            return Ok(value);
        }
        let value = supplier()?;
        let existing = self
            .state
            .table
            .put_if_absent(self.entry(key), owner.liveness(), Self::encode(value.clone()))
            .and_then(Self::decode);
        // a concurrent `put` beat us; its value wins like any other existing value
        Ok(existing.unwrap_or(value))
    }

    /// Replaces the value attached to `owner` with `f(current)` and returns what
    /// was stored.
    ///
    /// Calls to `compute` and first calls to
    /// [`compute_if_absent`](Self::compute_if_absent) for the same owner take turns,
    /// so `f` always sees the latest value they stored. Plain [`put`](Self::put)s
    /// are not ordered against it. As with `compute_if_absent`, no table lock is
    /// held while `f` runs.
    pub fn compute(&self, owner: &O, f: impl FnOnce(Option<V>) -> V) -> V {
        let key = owner.owner_key();
        let _pending = self.acquire(key);
        let value = f(self.get_key(key));
        self.put_key(key, owner, value.clone());
        value
    }

    /// Detaches and returns the value attached to `owner`.
    pub fn remove(&self, owner: &O) -> Option<V> {
        self.state
            .table
            .remove(self.entry(owner.owner_key()))
            .and_then(Self::decode)
    }

    /// Whether `owner` has a value.
    pub fn contains_key(&self, owner: &O) -> bool {
        self.state.table.contains_key(self.entry(owner.owner_key()))
    }

    /// The number of live owners with a value.
    pub fn len(&self) -> usize {
        self.state.table.len(self.state.kind)
    }

    /// Whether no live owner has a value.
    pub fn is_empty(&self) -> bool {
        self.state.table.is_empty(self.state.kind)
    }

    /// Expunges entries whose owners are gone. Returns how many were removed.
    ///
    /// When the table is shared with other kinds, their dead entries go too and
    /// are counted.
    pub fn reclaim(&self) -> usize {
        self.state.table.reclaim()
    }
}
