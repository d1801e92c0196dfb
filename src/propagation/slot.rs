// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-task context slot.

use crate::context::Context;
use crate::spinlock::Spinlock;

/// Where a [`PropagatedContext`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotPhase {
    /// Created, nothing stored yet.
    Unset,
    /// Holds a context waiting for the task to run.
    Set,
    /// The context was handed to the running task.
    Consumed,
    /// The submission failed or was cancelled before the task ran.
    Cleared,
}

#[derive(Debug)]
enum SlotState {
    Unset,
    Set(Context),
    Consumed,
    Cleared,
}

impl SlotState {
    fn phase(&self) -> SlotPhase {
        match self {
            SlotState::Unset => SlotPhase::Unset,
            SlotState::Set(_) => SlotPhase::Set,
            SlotState::Consumed => SlotPhase::Consumed,
            SlotState::Cleared => SlotPhase::Cleared,
        }
    }
}

/// Single-value holder for the context propagated into one task instance.
///
/// A slot moves `Unset → Set → Consumed`, or to `Cleared` when the submission
/// fails before the task runs. Only one context can be waiting at a time: a second
/// submitter never overwrites a context that is still waiting. Once the waiting
/// context has been consumed or cleared the slot accepts a context from a new
/// submission of the same task; the old context is never seen again.
#[derive(Debug)]
pub struct PropagatedContext {
    state: Spinlock<SlotState>,
}

impl Default for PropagatedContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PropagatedContext {
    /// An unset slot.
    pub fn new() -> Self {
        PropagatedContext {
            state: Spinlock::new(SlotState::Unset),
        }
    }

    /// Stores `context` unless another context is already waiting.
    ///
    /// Storing the context that is already waiting succeeds. Otherwise the waiting
    /// context is kept and returned as the error.
    pub fn set_context(&self, context: &Context) -> Result<(), Context> {
        let mut state = self.state.lock();
        match &*state {
            SlotState::Set(existing) if existing == context => Ok(()),
            SlotState::Set(existing) => Err(existing.clone()),
            SlotState::Unset | SlotState::Consumed | SlotState::Cleared => {
                *state = SlotState::Set(context.clone());
                Ok(())
            }
        }
    }

    /// Takes the waiting context, leaving the slot consumed.
    ///
    /// Returns `None` if no context is waiting; the phase is then left unchanged.
    pub fn take(&self) -> Option<Context> {
        let mut state = self.state.lock();
        if !matches!(&*state, SlotState::Set(_)) {
            return None;
        }
        match std::mem::replace(&mut *state, SlotState::Consumed) {
            SlotState::Set(context) => Some(context),
            _ => None,
        }
    }

    /// Drops any waiting context, leaving the slot cleared.
    pub fn clear(&self) {
        let previous = {
            let mut state = self.state.lock();
            if matches!(&*state, SlotState::Consumed) {
                return;
            }
            std::mem::replace(&mut *state, SlotState::Cleared)
        };
        // the context's last reference may go here; keep that outside the lock
        drop(previous);
    }

    /// The current phase.
    pub fn phase(&self) -> SlotPhase {
        self.state.lock().phase()
    }

    /// Whether a context is waiting.
    pub fn is_set(&self) -> bool {
        self.phase() == SlotPhase::Set
    }
}
