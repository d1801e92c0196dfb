// SPDX-License-Identifier: MIT OR Apache-2.0

//! Async context preservation.

use std::future::Future;
use std::pin::Pin;
use std::task::Poll;

use super::context_impl::Context;

/// A [`Future`] wrapper that makes a context current around every poll.
///
/// Thread-pool executors may poll a future on a different thread each time, so a
/// context captured at spawn time has to be re-entered on every poll rather than
/// once. `ApplyContext` enters its context, polls the inner future, and restores
/// whatever was current before, even if the inner poll panics.
///
/// # Examples
///
/// ```rust
/// use carrywise::context::{ApplyContext, Context};
///
/// async fn handler() -> Option<&'static str> {
///     Context::current().label().map(|_| "labelled")
/// }
///
/// # async fn example() {
/// let ctx = Context::root().child("request");
/// let result = ApplyContext::new(ctx, handler()).await;
/// assert_eq!(result, Some("labelled"));
/// # }
/// ```
pub struct ApplyContext<F>(Context, F);

impl<F> ApplyContext<F> {
    /// Wraps `f` so that `context` is current while it is polled.
    pub fn new(context: Context, f: F) -> Self {
        Self(context, f)
    }

    /// Wraps `f` with the context current on the calling thread.
    pub fn current(f: F) -> Self {
        Self(Context::current(), f)
    }

    /// The context applied during polling.
    pub fn context(&self) -> &Context {
        &self.0
    }
}

impl<F> Future for ApplyContext<F>
where
    F: Future,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        // SAFETY: the inner future is never moved out of `self`
        let (context, fut) = unsafe {
            let d = self.get_unchecked_mut();
            (&d.0, Pin::new_unchecked(&mut d.1))
        };
        let _scope = context.make_current();
        fut.poll(cx)
    }
}
