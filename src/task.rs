// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deferred tasks and stable wrappers for tasks with unreliable identity.
//!
//! A task handed to an executor is a [`RunnableRef`]: a shared [`Runnable`]. The
//! propagation machinery keys per-task state on the task's identity. Some tasks
//! are poor keys: an inline closure has an anonymous, compiler-generated type, so
//! nothing about it can be named, excluded, or recognized later. Such tasks are
//! replaced by a [`TaskWrapper`], a named delegate that forwards `run` unchanged,
//! and the wrapper becomes the key.
//!
//! Whether a task needs wrapping is an explicit capability,
//! [`Runnable::is_synthetic`]. Implementors that know the answer should say so;
//! the default guesses from the type name.

use std::sync::{Arc, OnceLock, Weak};

use crate::field::VirtualField;

/// A unit of deferred work.
///
/// Every `Fn() + Send + Sync + 'static` closure is a `Runnable`.
pub trait Runnable: Send + Sync + 'static {
    /// Runs the task body.
    fn run(&self);

    /// The name of the task's concrete type.
    ///
    /// Exclusion lists match against this. Wrappers report their delegate's name.
    fn task_type(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Whether this task's identity is unreliable as a key.
    ///
    /// Defaults to [`is_synthetic_type_name`] on [`task_type`](Runnable::task_type).
    fn is_synthetic(&self) -> bool {
        is_synthetic_type_name(self.task_type())
    }

    /// Whether this task is a [`TaskWrapper`].
    fn is_task_wrapper(&self) -> bool {
        false
    }
}

impl<F> Runnable for F
where
    F: Fn() + Send + Sync + 'static,
{
    #[inline]
    fn run(&self) {
        self()
    }
}

/// A shared, submittable task.
pub type RunnableRef = Arc<dyn Runnable>;

/// The legacy heuristic for compiler-generated types.
///
/// Declared types never contain `{` in their names; closures and other
/// compiler-synthesized types do (`my_crate::handler::{{closure}}`).
pub fn is_synthetic_type_name(name: &str) -> bool {
    name.contains('{')
}

/// A named stand-in for a task whose own identity is unreliable.
///
/// Running the wrapper runs the delegate. The wrapper reports the delegate's
/// [`task_type`](Runnable::task_type), so exclusion lists see through it.
pub struct TaskWrapper {
    delegate: RunnableRef,
}

impl TaskWrapper {
    /// The wrapped task.
    pub fn delegate(&self) -> &RunnableRef {
        &self.delegate
    }
}

impl std::fmt::Debug for TaskWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskWrapper")
            .field("delegate", &self.delegate.task_type())
            .finish()
    }
}

impl Runnable for TaskWrapper {
    #[inline]
    fn run(&self) {
        self.delegate.run()
    }

    fn task_type(&self) -> &'static str {
        self.delegate.task_type()
    }

    fn is_synthetic(&self) -> bool {
        false
    }

    fn is_task_wrapper(&self) -> bool {
        true
    }
}

/// Weak link from a raw task to its live wrapper.
#[derive(Clone)]
struct WrapperLink(Weak<TaskWrapper>);

fn wrappers() -> &'static VirtualField<RunnableRef, WrapperLink> {
    static WRAPPERS: OnceLock<VirtualField<RunnableRef, WrapperLink>> = OnceLock::new();
    WRAPPERS.get_or_init(VirtualField::find)
}

/// Whether `task` must be wrapped before it can key per-task state.
pub fn needs_wrapping(task: &RunnableRef) -> bool {
    task.is_synthetic() && !task.is_task_wrapper()
}

/// Returns the task to use as a key for `task`.
///
/// Tasks that are already good keys (including wrappers) come back unchanged.
/// Otherwise the task's wrapper is returned. While that wrapper is alive, wrapping
/// the same task again returns the same wrapper, so both calls key the same state.
///
/// ```rust
/// use carrywise::task::{RunnableRef, wrap_if_needed};
/// use std::sync::Arc;
///
/// let task: RunnableRef = Arc::new(|| {});
/// let first = wrap_if_needed(&task);
/// let second = wrap_if_needed(&task);
/// assert!(first.is_task_wrapper());
/// assert!(Arc::ptr_eq(&first, &second));
/// assert!(Arc::ptr_eq(&wrap_if_needed(&first), &first));
/// ```
pub fn wrap_if_needed(task: &RunnableRef) -> RunnableRef {
    if !needs_wrapping(task) {
        return task.clone();
    }
    if let Some(wrapper) = find_wrapper(task) {
        return wrapper;
    }
    let fresh = Arc::new(TaskWrapper {
        delegate: task.clone(),
    });
    loop {
        // callers racing past a dead link take turns here and adopt the first
        // replacement
        let link = wrappers().compute(task, |current| match current {
            Some(link) if link.0.strong_count() > 0 => link,
            _ => WrapperLink(Arc::downgrade(&fresh)),
        });
        if let Some(wrapper) = link.0.upgrade() {
            return wrapper;
        }
    }
}

/// The live wrapper previously created for `task`, if any.
pub(crate) fn find_wrapper(task: &RunnableRef) -> Option<RunnableRef> {
    let wrapper: RunnableRef = wrappers().get(task)?.0.upgrade()?;
    Some(wrapper)
}
