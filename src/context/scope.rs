// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reversible "make current" handles.

use std::marker::PhantomData;

use super::context_impl::{CURRENT, Context};

#[derive(Debug)]
struct Entered {
    context: Context,
    prior: Option<Context>,
}

/// Handle returned when a context is made current.
///
/// Dropping the scope restores exactly the context that was current before it
/// was created. A no-op scope (see [`Scope::noop`]) restores nothing; it is what
/// activation returns when there was nothing to activate.
///
/// Scopes are `!Send`: the thread that entered the context is the thread that
/// leaves it.
#[derive(Debug)]
#[must_use = "the context is only current until the scope is dropped"]
pub struct Scope {
    entered: Option<Entered>,
    _not_send: PhantomData<*const ()>,
}

impl Scope {
    pub(crate) fn entered(context: Context, prior: Option<Context>) -> Scope {
        Scope {
            entered: Some(Entered { context, prior }),
            _not_send: PhantomData,
        }
    }

    /// A scope that made nothing current and restores nothing.
    pub fn noop() -> Scope {
        Scope {
            entered: None,
            _not_send: PhantomData,
        }
    }

    /// Whether this scope is a no-op.
    pub fn is_noop(&self) -> bool {
        self.entered.is_none()
    }

    /// The context this scope made current, if any.
    pub fn context(&self) -> Option<&Context> {
        self.entered.as_ref().map(|e| &e.context)
    }

    /// Releases the scope now. Equivalent to dropping it.
    pub fn close(self) {}
}

impl Drop for Scope {
    fn drop(&mut self) {
        let Some(Entered { context, prior }) = self.entered.take() else {
            return;
        };
        // try_with: the thread-local may already be gone during thread teardown
        let replaced = CURRENT
            .try_with(|current| current.replace(prior))
            .ok()
            .flatten();
        if replaced.as_ref() != Some(&context) {
            logwise::warn_sync!(
                "Scope closed out of order: expected context {expected} to be current, found {found}",
                expected = context.context_id().0,
                found = replaced.map(|c| c.context_id().0)
            );
        }
    }
}
