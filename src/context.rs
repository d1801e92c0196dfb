// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ambient, thread-local context.
//!
//! A [`Context`] is an immutable snapshot of ambient state (a request ID, an active
//! trace, anything the application attaches with [`Context::with_value`]). Each
//! thread has exactly one current context; it starts out as [`Context::root`].
//!
//! Making a context current returns a [`Scope`]. Scopes nest strictly: dropping a
//! scope restores the context that was current when it was created.
//!
//! ```rust
//! use carrywise::context::Context;
//!
//! let outer = Context::root().child("outer");
//! let inner = outer.child("inner");
//!
//! let a = outer.make_current();
//! let b = inner.make_current();
//! assert_eq!(Context::current(), inner);
//! drop(b);
//! assert_eq!(Context::current(), outer);
//! drop(a);
//! assert!(Context::current().is_root());
//! ```
//!
//! # Crossing threads
//!
//! Thread-locals do not follow work onto other threads. For deferred work handed to
//! an executor, see [`crate::propagation`]. For futures polled on arbitrary threads,
//! wrap them in [`ApplyContext`].

mod apply_context;
mod context_impl;
mod scope;

#[cfg(test)]
mod tests;

pub use apply_context::ApplyContext;
pub use context_impl::{Context, ContextID};
pub use scope::Scope;
