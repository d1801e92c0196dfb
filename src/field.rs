// SPDX-License-Identifier: MIT OR Apache-2.0

//! Virtual fields: state attached to objects whose types cannot be changed.
//!
//! A [`VirtualField<O, V>`] simulates an extra field of type `V` on every owner of
//! type `O`. The values live in a side table keyed by owner identity. The table
//! holds only a [`Liveness`] check per owner, never the owner, so attaching a value
//! does not extend the owner's life.
//!
//! # Reclamation
//!
//! Rust has no tracing collector to clear weak entries behind our back, so
//! reclamation is observed rather than notified. An entry whose owner is gone is
//! never returned from a lookup, and is physically removed the next time its
//! table sweeps: periodically during writes, before [`VirtualField::len`] reports,
//! or on an explicit [`VirtualField::reclaim`]. Nobody has to call
//! [`VirtualField::remove`] for an entry to go away.
//!
//! ```rust
//! use carrywise::field::VirtualField;
//! use std::sync::Arc;
//!
//! struct Request;
//! #[derive(Clone)]
//! struct Note(&'static str);
//!
//! let notes = VirtualField::<Arc<Request>, Note>::find();
//! let request = Arc::new(Request);
//! notes.put(&request, Note("retry"));
//! let before = notes.len();
//!
//! drop(request);
//! assert_eq!(notes.len(), before - 1);
//! ```
//!
//! # Providers
//!
//! Tables come from the process-wide [`FieldProvider`]. [`DefaultFieldProvider`]
//! uses one synchronized table per field; [`ShardedFieldProvider`] stripes each
//! table over independent locks. See [`register_field_provider`].

mod owner;
mod provider;
mod table;
mod virtual_field;

#[cfg(test)]
mod tests;

pub use owner::{Liveness, Owner, OwnerKey};
pub use provider::{
    DefaultFieldProvider, FieldKind, FieldProvider, ShardedFieldProvider, field_provider,
    register_field_provider,
};
pub use table::{EntryKey, ErasedValue, FieldTable, ShardedTable, WeakKeyedTable};
pub use virtual_field::VirtualField;
