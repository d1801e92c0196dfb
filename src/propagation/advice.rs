// SPDX-License-Identifier: MIT OR Apache-2.0

//! Panic-safe hooks for interception points.
//!
//! Code that intercepts someone else's executor must never break it. Every hook here
//! catches panics from the propagation machinery (including panics from a task's
//! own [`task_type`](crate::task::Runnable::task_type)), logs them, and falls back
//! to leaving the task alone.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use super::call_depth::{CallDepth, CallDepthGuard};
use super::coordinator::Propagator;
use super::slot::PropagatedContext;
use crate::context::{Context, Scope};
use crate::task::RunnableRef;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs `hook`, returning `fallback()` if it panics.
pub(crate) fn guarded<R>(
    name: &'static str,
    fallback: impl FnOnce() -> R,
    hook: impl FnOnce() -> R,
) -> R {
    match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(r) => r,
        Err(payload) => {
            logwise::error_sync!(
                "Propagation hook {hook} panicked: {message}",
                hook = name,
                message = panic_message(payload.as_ref())
            );
            fallback()
        }
    }
}

/// The state carried from a submission's entry hook to its exit hook.
///
/// Created by [`SubmitAdvice::enter`] before the task is handed to the executor,
/// consumed by [`SubmitAdvice::exit`] once the executor returns.
#[must_use = "call exit() once the submission returns"]
pub struct SubmitAdvice {
    task: RunnableRef,
    slot: Option<Arc<PropagatedContext>>,
    _depth: CallDepthGuard,
}

impl std::fmt::Debug for SubmitAdvice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitAdvice")
            .field("task", &self.task.task_type())
            .field("slot", &self.slot)
            .finish()
    }
}

impl SubmitAdvice {
    /// Entry hook for submitting `task` to an executor of type `E` on this thread.
    ///
    /// Nested submissions to the same executor type (an overload forwarding to
    /// another) leave the task alone; only the outermost one attaches the current
    /// context.
    pub fn enter<E: 'static>(propagator: &Propagator, task: RunnableRef) -> Self {
        let depth = CallDepth::for_type::<E>().enter();
        let (task, slot) = if depth.is_outermost() {
            let original = task.clone();
            guarded(
                "submit entry",
                || (original, None),
                || {
                    let context = Context::current();
                    if propagator.should_propagate(&context, Some(&task)) {
                        let (slot, task) = propagator.attach(&context, &task).into_parts();
                        (task, Some(slot))
                    } else {
                        (task, None)
                    }
                },
            )
        } else {
            (task, None)
        };
        SubmitAdvice {
            task,
            slot,
            _depth: depth,
        }
    }

    /// The task to submit in place of the original.
    pub fn task(&self) -> &RunnableRef {
        &self.task
    }

    /// The slot the context was attached to, if any.
    pub fn slot(&self) -> Option<&Arc<PropagatedContext>> {
        self.slot.as_ref()
    }

    /// Exit hook. `error` is the submission's failure, if it failed.
    pub fn exit<E: ?Sized>(self, propagator: &Propagator, error: Option<&E>) {
        guarded(
            "submit exit",
            || (),
            || propagator.clean_up_on_submit_failure(self.slot.as_deref(), error),
        );
    }
}

/// Entry hook for running `task`: activates its propagated context, if any.
///
/// Hold the returned scope for the whole task body.
pub fn enter_task(propagator: &Propagator, task: &RunnableRef) -> Scope {
    guarded("task entry", Scope::noop, || propagator.activate_task(task))
}
