// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core Context implementation.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use super::scope::Scope;

pub(crate) static CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a context.
///
/// The root context always has ID 0. Every other context gets a fresh,
/// monotonically increasing ID when it is created.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContextID(pub(crate) u64);

impl Display for ContextID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Value = Arc<dyn Any + Send + Sync>;

/// Internal context data, shared behind an `Arc` so contexts are cheap to clone.
#[derive(Debug)]
pub(crate) struct ContextInner {
    pub(crate) parent: Option<Context>,
    pub(crate) context_id: u64,
    pub(crate) label: Option<String>,
    /// At most one value per type. Lookups fall through to the parent.
    pub(crate) value: Option<(TypeId, Value)>,
}

/// An immutable snapshot of ambient execution state.
///
/// A `Context` is opaque to the propagation machinery: it is captured on one
/// thread, stored, and made current again somewhere else. Equality and hashing
/// are by identity, so two contexts compare equal only if one is a clone of the
/// other.
///
/// Contexts form a chain from child to parent. Deriving a context never mutates
/// the original; [`with_value`](Context::with_value) and
/// [`child`](Context::child) return new contexts that point at their parent.
///
/// # Examples
///
/// ```rust
/// use carrywise::context::Context;
///
/// #[derive(Debug, PartialEq)]
/// struct RequestId(u64);
///
/// let ctx = Context::current().with_value(RequestId(7));
/// {
///     let _scope = ctx.make_current();
///     assert_eq!(Context::current().get::<RequestId>(), Some(&RequestId(7)));
/// }
/// // the previous context is back
/// assert!(Context::current().get::<RequestId>().is_none());
/// ```
#[derive(Debug, Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Context {}

impl Hash for Context {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.inner).hash(state);
    }
}

impl Display for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.label() {
            Some(label) => write!(f, "{} ({})", self.context_id(), label),
            None => write!(f, "{}", self.context_id()),
        }
    }
}

static ROOT: OnceLock<Context> = OnceLock::new();

thread_local! {
    // None means "root"; avoids touching ROOT on threads that never propagate.
    pub(crate) static CURRENT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

impl Context {
    /// Returns the empty root context.
    ///
    /// Every thread starts out with the root context current. Propagating the root
    /// context carries no information, so the propagation machinery refuses to do it.
    pub fn root() -> Context {
        ROOT.get_or_init(|| Context {
            inner: Arc::new(ContextInner {
                parent: None,
                context_id: 0,
                label: None,
                value: None,
            }),
        })
        .clone()
    }

    /// Whether this is the [root](Context::root) context.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.inner.context_id == 0
    }

    /// Returns the context that is current on this thread.
    #[inline]
    pub fn current() -> Context {
        CURRENT
            .try_with(|current| current.borrow().clone())
            .ok()
            .flatten()
            .unwrap_or_else(Context::root)
    }

    fn derive(&self, label: Option<String>, value: Option<(TypeId, Value)>) -> Context {
        Context {
            inner: Arc::new(ContextInner {
                parent: Some(self.clone()),
                context_id: CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                label,
                value,
            }),
        }
    }

    /// Creates a labelled child of this context.
    ///
    /// ```rust
    /// use carrywise::context::Context;
    ///
    /// let child = Context::root().child("batch-import");
    /// assert_eq!(child.label(), Some("batch-import"));
    /// assert_eq!(child.parent(), Some(&Context::root()));
    /// ```
    pub fn child(&self, label: impl Into<String>) -> Context {
        self.derive(Some(label.into()), None)
    }

    /// Creates a child of this context carrying `value`.
    ///
    /// The value shadows any value of the same type further up the chain.
    pub fn with_value<T: Any + Send + Sync>(&self, value: T) -> Context {
        self.derive(None, Some((TypeId::of::<T>(), Arc::new(value))))
    }

    /// Looks up the nearest value of type `T` in this context or its ancestors.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        let mut current = self;
        loop {
            if let Some((type_id, value)) = &current.inner.value {
                if *type_id == TypeId::of::<T>() {
                    return value.downcast_ref::<T>();
                }
            }
            current = current.inner.parent.as_ref()?;
        }
    }

    /// The label of this context, if it was created with [`child`](Context::child).
    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    /// The parent of this context. Only the root has none.
    pub fn parent(&self) -> Option<&Context> {
        self.inner.parent.as_ref()
    }

    /// Returns the unique ID of this context.
    #[inline]
    pub fn context_id(&self) -> ContextID {
        ContextID(self.inner.context_id)
    }

    /// Makes this context current on the calling thread.
    ///
    /// The returned [`Scope`] restores the previously current context when it is
    /// dropped. Scopes must be released in reverse order of creation; the scope
    /// is `!Send` so it cannot be released on another thread.
    #[must_use = "the context is only current until the scope is dropped"]
    pub fn make_current(&self) -> Scope {
        let prior = CURRENT.with(|current| current.replace(Some(self.clone())));
        Scope::entered(self.clone(), prior)
    }

    /// Runs `f` with this context current, restoring the prior context afterwards.
    pub fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        let _scope = self.make_current();
        f()
    }
}
