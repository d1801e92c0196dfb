// SPDX-License-Identifier: MIT OR Apache-2.0

//! Owner identity and liveness.

use std::sync::{Arc, Weak};

/// Identity of an owner inside a field table.
///
/// Two owners with the same key are the same owner for as long as either one's
/// [`Liveness`] reports it alive.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerKey(usize);

impl OwnerKey {
    /// Builds a key from a raw identity.
    ///
    /// Custom [`Owner`] implementations must hand out keys that stay unique while
    /// the owner is alive.
    pub const fn from_raw(raw: usize) -> Self {
        OwnerKey(raw)
    }

    /// The raw identity.
    pub const fn as_raw(self) -> usize {
        self.0
    }
}

/// Reports whether an owner is still reachable.
///
/// A field table keeps one of these per entry instead of the owner itself.
pub trait Liveness: Send + Sync {
    /// `false` once the owner is gone. Must never flip back to `true`.
    fn is_live(&self) -> bool;
}

impl<T: ?Sized + Send + Sync> Liveness for Weak<T> {
    #[inline]
    fn is_live(&self) -> bool {
        self.strong_count() > 0
    }
}

/// A value that can key a [`VirtualField`](super::VirtualField).
///
/// Owners are only ever used as identities: the store never mutates or retains
/// them. `Arc<T>` is an owner out of the box; its key is the allocation address
/// and its liveness is a `Weak<T>`.
pub trait Owner {
    /// The identity of this owner.
    fn owner_key(&self) -> OwnerKey;

    /// A check that reports when this owner has been reclaimed.
    fn liveness(&self) -> Box<dyn Liveness>;
}

impl<T: ?Sized + Send + Sync + 'static> Owner for Arc<T> {
    #[inline]
    fn owner_key(&self) -> OwnerKey {
        // The Weak held by the entry keeps the allocation reserved, so the
        // address cannot be handed to another Arc while the entry exists.
        OwnerKey(Arc::as_ptr(self).cast::<()>() as usize)
    }

    fn liveness(&self) -> Box<dyn Liveness> {
        Box::new(Arc::downgrade(self))
    }
}
