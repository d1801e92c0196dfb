// SPDX-License-Identifier: MIT OR Apache-2.0

//! Value-returning submissions and their handles.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::TaskError;
use crate::propagation::{HandleRef, Propagator};
use crate::task::Runnable;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Body<T> = Box<dyn FnOnce() -> T + Send>;

enum CallState<T> {
    Pending(Body<T>),
    Running,
    Finished(T),
    Panicked,
    Cancelled,
    Joined,
}

/// A submitted closure and the slot its result lands in.
///
/// The same allocation is the task handed to the executor and the identity
/// its [`TaskHandle`] is linked under.
pub(super) struct Call<T> {
    task_type: &'static str,
    state: Mutex<CallState<T>>,
    settled: Condvar,
}

impl<T: Send + 'static> Call<T> {
    pub(super) fn new<F>(body: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Call {
            task_type: std::any::type_name::<F>(),
            state: Mutex::new(CallState::Pending(Box::new(body))),
            settled: Condvar::new(),
        }
    }

    fn settle(&self, outcome: CallState<T>) {
        *lock(&self.state) = outcome;
        self.settled.notify_all();
    }
}

impl<T: Send + 'static> Runnable for Call<T> {
    fn run(&self) {
        let body = {
            let mut state = lock(&self.state);
            match std::mem::replace(&mut *state, CallState::Running) {
                CallState::Pending(body) => body,
                // cancelled, or run twice by a confused executor
                other => {
                    *state = other;
                    return;
                }
            }
        };
        match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(value) => self.settle(CallState::Finished(value)),
            Err(payload) => {
                self.settle(CallState::Panicked);
                panic::resume_unwind(payload);
            }
        }
    }

    fn task_type(&self) -> &'static str {
        self.task_type
    }

    fn is_synthetic(&self) -> bool {
        // every submission allocates its own call
        false
    }
}

/// The caller's side of a value-returning submission.
///
/// Returned by [`ContextPropagatingExecutor::submit`](super::ContextPropagatingExecutor::submit).
/// Cancelling a task that has not started also releases the context that was
/// waiting for it.
pub struct TaskHandle<T> {
    call: Arc<Call<T>>,
    propagator: Arc<Propagator>,
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task", &self.call.task_type)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> TaskHandle<T> {
    pub(super) fn new(call: Arc<Call<T>>, propagator: Arc<Propagator>) -> Self {
        TaskHandle { call, propagator }
    }

    /// The identity this handle is linked under in the propagator.
    pub(super) fn handle_ref(call: &Arc<Call<T>>) -> HandleRef {
        call.clone()
    }

    /// Stops the task from running, if it has not started yet.
    ///
    /// Returns whether the task was cancelled. A cancelled task's context is
    /// cleared immediately instead of waiting for the executor to drop the task.
    pub fn cancel(&self) -> bool {
        let cancelled = {
            let mut state = lock(&self.call.state);
            if matches!(*state, CallState::Pending(_)) {
                Some(std::mem::replace(&mut *state, CallState::Cancelled))
            } else {
                None
            }
        };
        let Some(body) = cancelled else {
            return false;
        };
        self.call.settled.notify_all();
        drop(body);
        self.propagator
            .cancel_handle(&TaskHandle::handle_ref(&self.call));
        true
    }

    /// Whether the task has finished, panicked, or been cancelled.
    pub fn is_finished(&self) -> bool {
        !matches!(
            &*lock(&self.call.state),
            CallState::Pending(_) | CallState::Running
        )
    }

    /// Blocks until the task settles and returns its value.
    pub fn join(self) -> Result<T, TaskError> {
        let mut state = lock(&self.call.state);
        while matches!(&*state, CallState::Pending(_) | CallState::Running) {
            state = self
                .call
                .settled
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match std::mem::replace(&mut *state, CallState::Joined) {
            CallState::Finished(value) => Ok(value),
            CallState::Cancelled => Err(TaskError::Cancelled),
            _ => Err(TaskError::Panicked),
        }
    }
}
