// SPDX-License-Identifier: MIT OR Apache-2.0

/*!
Carrying a context across an asynchronous hand-off.

When a task is submitted, the submitter's current [`Context`](crate::context::Context)
is stored in a [`PropagatedContext`] slot attached to the task through a
[`VirtualField`](crate::field::VirtualField). When the task starts on a worker, the
slot is drained and the context becomes current for exactly the duration of the
task body.

[`Propagator`] implements the protocol; [`SubmitAdvice`] and [`enter_task`] wrap it
in panic-safe hooks for interception layers such as
[`ContextPropagatingExecutor`](crate::executor::ContextPropagatingExecutor).
*/

mod advice;
mod call_depth;
mod coordinator;
mod slot;


pub use advice::{SubmitAdvice, enter_task};
pub(crate) use advice::guarded;
pub use call_depth::{CallDepth, CallDepthGuard};
pub use coordinator::{Attachment, BatchAttachment, HandleRef, Propagator};
pub use slot::{PropagatedContext, SlotPhase};
