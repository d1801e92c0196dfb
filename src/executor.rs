// SPDX-License-Identifier: MIT OR Apache-2.0

/*!
An executor adapter that propagates the submitter's context.

[`ContextPropagatingExecutor`] sits in front of any [`Executor`] and follows the
submission protocol of [`Propagator`]: it captures the current context, attaches it
to the task, submits a task that activates the context when it starts, and cleans up
if the inner executor refuses the task.

[`ContextPropagatingExecutor::submit`] does the same for a closure that returns a
value, and hands back a [`TaskHandle`] that can wait for the value or cancel the
task. Cancelling a task that has not started releases its waiting context.

```rust
use carrywise::context::Context;
use carrywise::executor::{ContextPropagatingExecutor, Executor};
use carrywise::task::RunnableRef;
use std::convert::Infallible;
use std::sync::Arc;

/// Runs every task on a fresh thread.
struct ThreadPerTask;

impl Executor for ThreadPerTask {
    type Error = Infallible;
    fn execute(&self, task: RunnableRef) -> Result<(), Infallible> {
        std::thread::spawn(move || task.run()).join().ok();
        Ok(())
    }
}

let executor = ContextPropagatingExecutor::new(ThreadPerTask);
let ctx = Context::root().child("request");
ctx.in_scope(|| {
    executor
        .execute(Arc::new(|| assert_eq!(Context::current().label(), Some("request"))))
        .unwrap();
});
```
*/

mod handle;

use std::sync::Arc;

use crate::context::{Context, Scope};
use crate::propagation::{
    BatchAttachment, CallDepth, PropagatedContext, Propagator, SubmitAdvice, guarded,
};
use crate::task::{Runnable, RunnableRef};
use handle::Call;

pub use handle::TaskHandle;

/// Something that runs tasks, now or later, on this thread or another.
pub trait Executor {
    /// Why a task was refused.
    type Error;

    /// Submits `task`. On success the executor has taken responsibility for running it.
    fn execute(&self, task: RunnableRef) -> Result<(), Self::Error>;

    /// Submits every task in order, stopping at the first refusal.
    fn execute_all(&self, tasks: Vec<RunnableRef>) -> Result<(), Self::Error> {
        for task in tasks {
            self.execute(task)?;
        }
        Ok(())
    }
}

/// Runs a task inside the context attached by its own submission.
struct Instrumented {
    task: RunnableRef,
    slot: Arc<PropagatedContext>,
    propagator: Arc<Propagator>,
}

impl Runnable for Instrumented {
    fn run(&self) {
        // the scope is released on unwind as well
        let _scope = guarded("task entry", Scope::noop, || {
            self.propagator.activate(&self.slot)
        });
        self.task.run();
    }

    fn task_type(&self) -> &'static str {
        self.task.task_type()
    }

    fn is_synthetic(&self) -> bool {
        false
    }
}

/// An [`Executor`] that carries the submitter's [`Context`] into each task.
#[derive(Debug)]
pub struct ContextPropagatingExecutor<E> {
    inner: E,
    propagator: Arc<Propagator>,
}

impl<E: Executor + 'static> ContextPropagatingExecutor<E> {
    /// Wraps `inner`, using [`Propagator::global`].
    pub fn new(inner: E) -> Self {
        Self::with_propagator(inner, Propagator::global())
    }

    /// Wraps `inner`, coordinating through `propagator`.
    pub fn with_propagator(inner: E, propagator: Arc<Propagator>) -> Self {
        ContextPropagatingExecutor { inner, propagator }
    }

    /// The wrapped executor.
    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// The propagator this executor coordinates through.
    pub fn propagator(&self) -> &Arc<Propagator> {
        &self.propagator
    }

    /// Unwraps the inner executor.
    pub fn into_inner(self) -> E {
        self.inner
    }

    /// Submits a value-returning task and returns a handle to its result.
    ///
    /// The task runs in the submitter's context, like [`execute`](Executor::execute).
    /// If the inner executor refuses it, the refusal is returned and the context is
    /// released.
    pub fn submit<T, F>(&self, body: F) -> Result<TaskHandle<T>, E::Error>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let call = Arc::new(Call::new(body));
        let advice = SubmitAdvice::enter::<Self>(&self.propagator, call.clone());
        let result = self
            .inner
            .execute(self.instrument(advice.task(), advice.slot()));
        if let (Ok(()), Some(slot)) = (&result, advice.slot()) {
            let handle = TaskHandle::handle_ref(&call);
            guarded(
                "submit link",
                || (),
                || self.propagator.link_handle(&handle, slot),
            );
        }
        advice.exit(&self.propagator, result.as_ref().err());
        result.map(|()| TaskHandle::new(call, self.propagator.clone()))
    }

    /// The task to hand to the inner executor: `task` itself when nothing was
    /// attached to it.
    fn instrument(&self, task: &RunnableRef, slot: Option<&Arc<PropagatedContext>>) -> RunnableRef {
        match slot {
            Some(slot) => Arc::new(Instrumented {
                task: task.clone(),
                slot: slot.clone(),
                propagator: self.propagator.clone(),
            }),
            None => task.clone(),
        }
    }
}

impl<E: Executor + 'static> Executor for ContextPropagatingExecutor<E> {
    type Error = E::Error;

    fn execute(&self, task: RunnableRef) -> Result<(), E::Error> {
        let advice = SubmitAdvice::enter::<Self>(&self.propagator, task);
        let result = self
            .inner
            .execute(self.instrument(advice.task(), advice.slot()));
        advice.exit(&self.propagator, result.as_ref().err());
        result
    }

    fn execute_all(&self, tasks: Vec<RunnableRef>) -> Result<(), E::Error> {
        let depth = CallDepth::for_type::<Self>().enter();
        if !depth.is_outermost() {
            return self.inner.execute_all(tasks);
        }
        let fallback = tasks.clone();
        let batch = guarded(
            "batch submit entry",
            || BatchAttachment::unattached(fallback),
            || self.propagator.attach_all(&Context::current(), &tasks),
        );
        let submitted = batch
            .iter()
            .map(|(task, slot)| self.instrument(task, slot))
            .collect();
        let result = self.inner.execute_all(submitted);
        guarded(
            "batch submit exit",
            || (),
            || {
                self.propagator
                    .clean_up_all_on_submit_failure(&batch, result.as_ref().err())
            },
        );
        result
    }
}
