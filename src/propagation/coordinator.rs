// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attach-on-submit, activate-on-run.

use std::any::Any;
use std::sync::{Arc, OnceLock};

use super::slot::PropagatedContext;
use crate::config::PropagationConfig;
use crate::context::{Context, Scope};
use crate::field::VirtualField;
use crate::task::{RunnableRef, find_wrapper, needs_wrapping, wrap_if_needed};

/// A submission handle (a join handle, a future) that can cancel its task.
pub type HandleRef = Arc<dyn Any + Send + Sync>;

/// The outcome of [`Propagator::attach`].
#[derive(Clone)]
pub struct Attachment {
    slot: Arc<PropagatedContext>,
    task: RunnableRef,
}

impl Attachment {
    /// The slot holding the context, for cleanup if the submission fails.
    pub fn slot(&self) -> &Arc<PropagatedContext> {
        &self.slot
    }

    /// The task to submit in place of the original (its wrapper, when one was needed).
    pub fn task(&self) -> &RunnableRef {
        &self.task
    }

    /// Splits the attachment into the slot and the task to submit.
    pub fn into_parts(self) -> (Arc<PropagatedContext>, RunnableRef) {
        (self.slot, self.task)
    }
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("slot", &self.slot)
            .field("task", &self.task.task_type())
            .finish()
    }
}

/// The tasks and slots of a batch submission, see [`Propagator::attach_all`].
///
/// `tasks` and `slots` line up one for one; a task that did not receive the
/// context has no slot.
#[derive(Default)]
pub struct BatchAttachment {
    /// The tasks to submit, in the original order.
    pub tasks: Vec<RunnableRef>,
    /// The slot each task's context was attached to, if any.
    pub slots: Vec<Option<Arc<PropagatedContext>>>,
}

impl BatchAttachment {
    /// A batch that carries nothing: `tasks` go out unchanged.
    pub fn unattached(tasks: Vec<RunnableRef>) -> Self {
        let slots = vec![None; tasks.len()];
        BatchAttachment { tasks, slots }
    }

    /// Each task to submit, paired with its slot.
    pub fn iter(&self) -> impl Iterator<Item = (&RunnableRef, Option<&Arc<PropagatedContext>>)> {
        self.tasks.iter().zip(self.slots.iter().map(Option::as_ref))
    }

    /// The slots that received the context.
    pub fn attached_slots(&self) -> impl Iterator<Item = &Arc<PropagatedContext>> {
        self.slots.iter().flatten()
    }
}

impl std::fmt::Debug for BatchAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tasks: Vec<&'static str> = self.tasks.iter().map(|task| task.task_type()).collect();
        f.debug_struct("BatchAttachment")
            .field("tasks", &tasks)
            .field("slots", &self.slots)
            .finish()
    }
}

/// Coordinates carrying a [`Context`] from a submitting thread into a task.
///
/// The expected protocol, driven by whatever intercepts submission and execution:
///
/// 1. On submit, capture [`Context::current`] and check
///    [`should_propagate`](Propagator::should_propagate).
/// 2. If it says yes, [`attach`](Propagator::attach) and submit
///    [`Attachment::task`] instead of the original task.
/// 3. If submitting fails, call
///    [`clean_up_on_submit_failure`](Propagator::clean_up_on_submit_failure).
/// 4. On the worker, immediately before the task body, call
///    [`activate`](Propagator::activate) (or [`activate_task`](Propagator::activate_task))
///    and hold the returned scope for the whole body.
///
/// ```rust
/// use carrywise::config::PropagationConfig;
/// use carrywise::context::Context;
/// use carrywise::propagation::Propagator;
/// use carrywise::task::RunnableRef;
/// use std::sync::Arc;
///
/// let propagator = Propagator::new(PropagationConfig::default());
/// let ctx = Context::root().child("checkout");
/// let task: RunnableRef = Arc::new(|| {});
///
/// assert!(propagator.should_propagate(&ctx, Some(&task)));
/// let attachment = propagator.attach(&ctx, &task);
///
/// std::thread::spawn(move || {
///     let scope = propagator.activate(attachment.slot());
///     assert_eq!(Context::current().label(), Some("checkout"));
///     attachment.task().run();
///     drop(scope);
/// })
/// .join()
/// .unwrap();
/// ```
pub struct Propagator {
    config: PropagationConfig,
    slots: VirtualField<RunnableRef, Arc<PropagatedContext>>,
    handles: VirtualField<HandleRef, Arc<PropagatedContext>>,
}

impl std::fmt::Debug for Propagator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Propagator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Propagator {
    /// A propagator over the process-wide slot fields.
    pub fn new(config: PropagationConfig) -> Self {
        Propagator {
            config,
            slots: VirtualField::find(),
            handles: VirtualField::find(),
        }
    }

    /// A propagator over caller-supplied fields.
    pub fn with_fields(
        config: PropagationConfig,
        slots: VirtualField<RunnableRef, Arc<PropagatedContext>>,
        handles: VirtualField<HandleRef, Arc<PropagatedContext>>,
    ) -> Self {
        Propagator {
            config,
            slots,
            handles,
        }
    }

    /// The process-wide propagator, configured from the environment on first use.
    ///
    /// An invalid environment is logged and the defaults are used instead.
    pub fn global() -> Arc<Propagator> {
        static GLOBAL: OnceLock<Arc<Propagator>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| {
                let config = PropagationConfig::from_env().unwrap_or_else(|e| {
                    logwise::warn_sync!(
                        "Ignoring invalid propagation settings: {error}",
                        error = e.to_string()
                    );
                    PropagationConfig::default()
                });
                Arc::new(Propagator::new(config))
            })
            .clone()
    }

    /// The settings this propagator was built with.
    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    /// Whether `context` should be carried into `task`.
    ///
    /// Never for a missing task, never for the root context (there is nothing to
    /// carry), never for excluded task types, never when disabled.
    pub fn should_propagate(&self, context: &Context, task: Option<&RunnableRef>) -> bool {
        let Some(task) = task else {
            return false;
        };
        if !self.config.enabled() {
            return false;
        }
        let task_type = task.task_type();
        if context.is_root() {
            if self.config.strict_root() {
                logwise::warn_sync!(
                    "Refusing to propagate the root context into {task}",
                    task = task_type
                );
            }
            return false;
        }
        !self.config.is_excluded(task_type)
    }

    /// Stores `context` in the slot for `task`, creating the slot if needed.
    ///
    /// If a different context is still waiting in the slot (a concurrent
    /// submission of the same task won), that context is kept and this one is
    /// dropped.
    pub fn attach(&self, context: &Context, task: &RunnableRef) -> Attachment {
        let task = wrap_if_needed(task);
        let slot = self
            .slots
            .compute_if_absent(&task, || Arc::new(PropagatedContext::new()));
        if let Err(waiting) = slot.set_context(context) {
            logwise::debuginternal_sync!(
                "Not propagating context {new} into {task}: context {old} is still waiting",
                new = context.context_id().0,
                task = task.task_type(),
                old = waiting.context_id().0
            );
        }
        Attachment { slot, task }
    }

    /// Attaches `context` to every task that should receive it.
    ///
    /// The returned tasks replace `tasks` one for one. A task that should not
    /// receive the context comes back unchanged and without a slot.
    pub fn attach_all(&self, context: &Context, tasks: &[RunnableRef]) -> BatchAttachment {
        let mut batch = BatchAttachment::default();
        for task in tasks {
            if self.should_propagate(context, Some(task)) {
                let (slot, task) = self.attach(context, task).into_parts();
                batch.slots.push(Some(slot));
                batch.tasks.push(task);
            } else {
                batch.slots.push(None);
                batch.tasks.push(task.clone());
            }
        }
        batch
    }

    /// Clears `slot` if the submission failed, so the context cannot leak.
    pub fn clean_up_on_submit_failure<E: ?Sized>(
        &self,
        slot: Option<&PropagatedContext>,
        error: Option<&E>,
    ) {
        if let (Some(slot), Some(_)) = (slot, error) {
            slot.clear();
        }
    }

    /// Clears every slot of a failed batch submission.
    pub fn clean_up_all_on_submit_failure<E: ?Sized>(
        &self,
        batch: &BatchAttachment,
        error: Option<&E>,
    ) {
        for slot in batch.attached_slots() {
            self.clean_up_on_submit_failure(Some(slot.as_ref()), error);
        }
    }

    /// Takes the waiting context and makes it current on this thread.
    ///
    /// Returns a no-op scope when nothing is waiting, including on every call after
    /// the first for the same submission.
    pub fn activate(&self, slot: &PropagatedContext) -> Scope {
        match slot.take() {
            Some(context) => context.make_current(),
            None => Scope::noop(),
        }
    }

    /// The slot for `task`, if one was ever attached.
    pub fn slot_for(&self, task: &RunnableRef) -> Option<Arc<PropagatedContext>> {
        let key = if needs_wrapping(task) {
            find_wrapper(task)?
        } else {
            task.clone()
        };
        self.slots.get(&key)
    }

    /// Looks up the slot for `task` and [activates](Propagator::activate) it.
    pub fn activate_task(&self, task: &RunnableRef) -> Scope {
        match self.slot_for(task) {
            Some(slot) => self.activate(&slot),
            None => Scope::noop(),
        }
    }

    /// Associates a submission handle with the slot of the task it controls.
    pub fn link_handle(&self, handle: &HandleRef, slot: &Arc<PropagatedContext>) {
        self.handles.put(handle, slot.clone());
    }

    /// Clears the slot linked to `handle`. Returns whether one was linked.
    ///
    /// For cancellation: a task that will never run should not keep its context
    /// reachable.
    pub fn cancel_handle(&self, handle: &HandleRef) -> bool {
        match self.handles.remove(handle) {
            Some(slot) => {
                slot.clear();
                true
            }
            None => false,
        }
    }
}
