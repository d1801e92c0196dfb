// SPDX-License-Identifier: MIT OR Apache-2.0

//! Contexts following futures.

use carrywise::context::{ApplyContext, Context};
use std::future::Future;
use std::pin::Pin;
use std::task::Poll;

/// Pending on the first poll, ready on the second.
struct YieldOnce(bool);

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<()> {
        if self.0 {
            Poll::Ready(())
        } else {
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[test_executors::async_test]
async fn context_survives_suspension() {
    let ctx = Context::root().child("async-request");
    let inner = ctx.clone();
    let label = ApplyContext::new(ctx, async move {
        assert_eq!(Context::current(), inner);
        YieldOnce(false).await;
        assert_eq!(Context::current(), inner);
        Context::current().label().map(str::to_string)
    })
    .await;
    assert_eq!(label.as_deref(), Some("async-request"));
    assert!(Context::current().is_root());
}

#[test_executors::async_test]
async fn current_captures_at_construction() {
    let ctx = Context::root().child("captured");
    let fut = ctx.in_scope(|| {
        ApplyContext::current(async { Context::current().label().map(str::to_string) })
    });
    assert!(Context::current().is_root());
    assert_eq!(fut.await.as_deref(), Some("captured"));
}
