// SPDX-License-Identifier: MIT OR Apache-2.0

//! Weak-keyed side tables.
//!
//! A table maps [`EntryKey`]s (a field kind plus an owner) to type-erased values.
//! One table may back several kinds; entries of one kind are invisible to every
//! other kind. A table never holds an owner, only
//! the owner's [`Liveness`] check, so an entry never keeps its owner alive. Entries
//! whose owner is gone are invisible to lookups and are expunged lazily: on a
//! lookup that hits them, every so often on writes, before [`FieldTable::len`]
//! reports, and whenever [`FieldTable::reclaim`] runs.
//!
//! Values displaced from a table are dropped only after the table lock is
//! released, so a value's `Drop` never runs inside a critical section.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::owner::{Liveness, OwnerKey};
use super::provider::FieldKind;
use crate::spinlock::Spinlock;

/// A value as stored in a [`FieldTable`].
pub type ErasedValue = Arc<dyn Any + Send + Sync>;

/// Writes between opportunistic sweeps of a shard.
const SWEEP_INTERVAL: usize = 64;

/// One owner's entry for one field kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntryKey {
    /// The field the value belongs to.
    pub kind: FieldKind,
    /// The owner the value is attached to.
    pub owner: OwnerKey,
}

impl EntryKey {
    /// The entry of `owner` for `kind`.
    pub fn new(kind: FieldKind, owner: OwnerKey) -> Self {
        EntryKey { kind, owner }
    }
}

/// Storage backing one or more [`FieldKind`]s.
///
/// Implementations must be safe to call from any number of threads without
/// external locking, must treat an entry whose owner is no longer live
/// exactly as if it were absent, and must keep the entries of different kinds
/// apart even when their owners are the same.
pub trait FieldTable: Send + Sync {
    /// The live value for `key`.
    fn get(&self, key: EntryKey) -> Option<ErasedValue>;

    /// Stores `value`, returning the live value it replaced.
    fn put(&self, key: EntryKey, liveness: Box<dyn Liveness>, value: ErasedValue)
    -> Option<ErasedValue>;

    /// Stores `value` unless a live value exists; returns that existing value.
    fn put_if_absent(
        &self,
        key: EntryKey,
        liveness: Box<dyn Liveness>,
        value: ErasedValue,
    ) -> Option<ErasedValue>;

    /// Removes and returns the live value for `key`.
    fn remove(&self, key: EntryKey) -> Option<ErasedValue>;

    /// Whether a live value exists for `key`.
    fn contains_key(&self, key: EntryKey) -> bool {
        self.get(key).is_some()
    }

    /// The number of live entries of `kind`.
    fn len(&self, kind: FieldKind) -> usize;

    /// Whether there are no live entries of `kind`.
    fn is_empty(&self, kind: FieldKind) -> bool {
        self.len(kind) == 0
    }

    /// Expunges every entry whose owner is gone, whatever its kind. Returns how
    /// many were removed.
    fn reclaim(&self) -> usize;
}

pub(crate) struct Entry {
    liveness: Box<dyn Liveness>,
    value: ErasedValue,
}

/// Entries pulled out under a lock, dropped once the lock is gone.
type Graveyard = Vec<Entry>;

#[derive(Default)]
struct Shard {
    entries: HashMap<EntryKey, Entry>,
    writes: usize,
}

impl Shard {
    fn get(&mut self, key: EntryKey, dead: &mut Graveyard) -> Option<ErasedValue> {
        match self.entries.get(&key) {
            Some(entry) if entry.liveness.is_live() => Some(entry.value.clone()),
            Some(_) => {
                dead.extend(self.entries.remove(&key));
                None
            }
            None => None,
        }
    }

    fn put(
        &mut self,
        key: EntryKey,
        liveness: Box<dyn Liveness>,
        value: ErasedValue,
        dead: &mut Graveyard,
    ) -> Option<ErasedValue> {
        self.note_write(dead);
        let previous = self.entries.insert(key, Entry { liveness, value })?;
        let replaced = previous
            .liveness
            .is_live()
            .then(|| previous.value.clone());
        dead.push(previous);
        replaced
    }

    fn put_if_absent(
        &mut self,
        key: EntryKey,
        liveness: Box<dyn Liveness>,
        value: ErasedValue,
        dead: &mut Graveyard,
    ) -> Option<ErasedValue> {
        if let Some(existing) = self.get(key, dead) {
            return Some(existing);
        }
        self.note_write(dead);
        self.entries.insert(key, Entry { liveness, value });
        None
    }

    fn remove(&mut self, key: EntryKey, dead: &mut Graveyard) -> Option<ErasedValue> {
        let entry = self.entries.remove(&key)?;
        let value = entry.liveness.is_live().then(|| entry.value.clone());
        dead.push(entry);
        value
    }

    fn note_write(&mut self, dead: &mut Graveyard) {
        self.writes += 1;
        if self.writes >= SWEEP_INTERVAL {
            self.sweep(dead);
        }
    }

    fn sweep(&mut self, dead: &mut Graveyard) -> usize {
        self.writes = 0;
        let stale: Vec<EntryKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.liveness.is_live())
            .map(|(key, _)| *key)
            .collect();
        for key in &stale {
            dead.extend(self.entries.remove(key));
        }
        stale.len()
    }

    fn count(&self, kind: FieldKind) -> usize {
        self.entries.keys().filter(|key| key.kind == kind).count()
    }
}

/// The default table: one mutex-synchronized weak-keyed map.
#[derive(Default)]
pub struct WeakKeyedTable {
    shard: Mutex<Shard>,
}

impl WeakKeyedTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_shard<R>(&self, f: impl FnOnce(&mut Shard, &mut Graveyard) -> R) -> R {
        let mut dead = Graveyard::new();
        let result = {
            let mut shard: MutexGuard<'_, Shard> =
                self.shard.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut shard, &mut dead)
        };
        drop(dead);
        result
    }
}

impl std::fmt::Debug for WeakKeyedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakKeyedTable").finish_non_exhaustive()
    }
}

impl FieldTable for WeakKeyedTable {
    fn get(&self, key: EntryKey) -> Option<ErasedValue> {
        self.with_shard(|shard, dead| shard.get(key, dead))
    }

    fn put(
        &self,
        key: EntryKey,
        liveness: Box<dyn Liveness>,
        value: ErasedValue,
    ) -> Option<ErasedValue> {
        self.with_shard(|shard, dead| shard.put(key, liveness, value, dead))
    }

    fn put_if_absent(
        &self,
        key: EntryKey,
        liveness: Box<dyn Liveness>,
        value: ErasedValue,
    ) -> Option<ErasedValue> {
        self.with_shard(|shard, dead| shard.put_if_absent(key, liveness, value, dead))
    }

    fn remove(&self, key: EntryKey) -> Option<ErasedValue> {
        self.with_shard(|shard, dead| shard.remove(key, dead))
    }

    fn len(&self, kind: FieldKind) -> usize {
        self.with_shard(|shard, dead| {
            shard.sweep(dead);
            shard.count(kind)
        })
    }

    fn reclaim(&self) -> usize {
        self.with_shard(|shard, dead| shard.sweep(dead))
    }
}

/// A lock-striped table: owners hash onto independent shards, so no lock is
/// shared between unrelated owners beyond their shard.
pub struct ShardedTable {
    shards: Box<[Spinlock<Shard>]>,
}

impl ShardedTable {
    /// Creates a table with `shards` independent shards (at least one).
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Spinlock::new(Shard::default()))
            .collect();
        ShardedTable { shards }
    }

    fn shard_for(&self, key: EntryKey) -> &Spinlock<Shard> {
        // low bits of an allocation address are alignment, not entropy
        let raw = key.owner.as_raw();
        let mixed = (raw >> 4) ^ (raw >> 12);
        &self.shards[mixed % self.shards.len()]
    }

    fn with_shard<R>(&self, key: EntryKey, f: impl FnOnce(&mut Shard, &mut Graveyard) -> R) -> R {
        let mut dead = Graveyard::new();
        let result = {
            let mut shard = self.shard_for(key).lock();
            f(&mut shard, &mut dead)
        };
        drop(dead);
        result
    }

    /// Sweeps every shard, one at a time. Returns how many entries were removed
    /// and how many live entries of `kind` remain.
    fn sweep_all(&self, kind: Option<FieldKind>) -> (usize, usize) {
        let mut removed = 0;
        let mut live = 0;
        for shard in self.shards.iter() {
            let mut dead = Graveyard::new();
            {
                let mut shard = shard.lock();
                removed += shard.sweep(&mut dead);
                live += kind.map_or(0, |kind| shard.count(kind));
            }
            drop(dead);
        }
        (removed, live)
    }
}

impl std::fmt::Debug for ShardedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedTable")
            .field("shards", &self.shards.len())
            .finish_non_exhaustive()
    }
}

impl FieldTable for ShardedTable {
    fn get(&self, key: EntryKey) -> Option<ErasedValue> {
        self.with_shard(key, |shard, dead| shard.get(key, dead))
    }

    fn put(
        &self,
        key: EntryKey,
        liveness: Box<dyn Liveness>,
        value: ErasedValue,
    ) -> Option<ErasedValue> {
        self.with_shard(key, |shard, dead| shard.put(key, liveness, value, dead))
    }

    fn put_if_absent(
        &self,
        key: EntryKey,
        liveness: Box<dyn Liveness>,
        value: ErasedValue,
    ) -> Option<ErasedValue> {
        self.with_shard(key, |shard, dead| {
            shard.put_if_absent(key, liveness, value, dead)
        })
    }

    fn remove(&self, key: EntryKey) -> Option<ErasedValue> {
        self.with_shard(key, |shard, dead| shard.remove(key, dead))
    }

    fn len(&self, kind: FieldKind) -> usize {
        self.sweep_all(Some(kind)).1
    }

    fn reclaim(&self) -> usize {
        self.sweep_all(None).0
    }
}
