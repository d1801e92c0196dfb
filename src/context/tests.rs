// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tests for the context module.

use super::context_impl::Context;
use super::scope::Scope;
use std::thread;

#[derive(Debug, PartialEq)]
struct RequestId(u64);

#[derive(Debug, PartialEq)]
struct Tenant(&'static str);

#[test]
fn test_fresh_thread_is_root() {
    thread::spawn(|| {
        assert!(Context::current().is_root());
        assert_eq!(Context::current(), Context::root());
        assert_eq!(Context::root().context_id().0, 0);
    })
    .join()
    .unwrap();
}

#[test]
fn test_context_equality() {
    let context1 = Context::root().child("a");
    let context2 = context1.clone();
    let context3 = Context::root().child("a");

    // identity, not structure
    assert_eq!(context1, context2);
    assert_ne!(context1, context3);
}

#[test]
#[allow(clippy::mutable_key_type)]
fn test_context_hash() {
    use std::collections::HashMap;

    let context1 = Context::root().child("one");
    let context2 = context1.clone();
    let context3 = Context::root().child("three");

    let mut map = HashMap::new();
    map.insert(context1.clone(), "value1");
    map.insert(context3.clone(), "value3");

    assert_eq!(map.get(&context2), Some(&"value1"));
    assert_eq!(map.get(&context3), Some(&"value3"));
    assert_eq!(map.len(), 2);
}

#[test]
fn test_values_shadow_and_inherit() {
    let base = Context::root()
        .with_value(RequestId(1))
        .with_value(Tenant("acme"));
    let shadowed = base.with_value(RequestId(2));

    assert_eq!(base.get::<RequestId>(), Some(&RequestId(1)));
    assert_eq!(shadowed.get::<RequestId>(), Some(&RequestId(2)));
    assert_eq!(shadowed.get::<Tenant>(), Some(&Tenant("acme")));
    assert!(Context::root().get::<Tenant>().is_none());
}

#[test]
fn test_display() {
    let labelled = Context::root().child("import");
    assert_eq!(
        format!("{}", labelled),
        format!("{} (import)", labelled.context_id())
    );
    assert_eq!(format!("{}", Context::root()), "0");
}

#[test]
fn test_scopes_nest_strictly() {
    let outer = Context::root().child("outer");
    let inner = outer.child("inner");
    let before = Context::current();

    let outer_scope = outer.make_current();
    assert_eq!(outer_scope.context(), Some(&outer));
    {
        let _inner_scope = inner.make_current();
        assert_eq!(Context::current(), inner);
    }
    assert_eq!(Context::current(), outer);
    outer_scope.close();
    assert_eq!(Context::current(), before);
}

#[test]
fn test_out_of_order_close_still_restores() {
    let before = Context::current();
    let a = Context::root().child("a").make_current();
    let b = Context::root().child("b").make_current();

    // wrong order: logged, but each scope still puts back its own prior context
    drop(a);
    assert_eq!(Context::current(), before);
    drop(b);
    assert_eq!(Context::current().label(), Some("a"));
}

#[test]
fn test_noop_scope() {
    let ctx = Context::root().child("untouched");
    let _scope = ctx.make_current();
    let noop = Scope::noop();
    assert!(noop.is_noop());
    assert!(noop.context().is_none());
    drop(noop);
    assert_eq!(Context::current(), ctx);
}

#[test]
fn test_in_scope_restores_after_panic() {
    let before = Context::current();
    let ctx = Context::root().child("panicky");
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        ctx.in_scope(|| {
            if Context::current().label() == Some("panicky") {
                panic!("boom");
            }
            1
        })
    }));
    assert!(result.is_err());
    assert_eq!(Context::current(), before);
}

#[test]
fn test_current_is_per_thread() {
    let ctx = Context::root().child("main-only");
    let _scope = ctx.make_current();
    let seen = thread::spawn(Context::current).join().unwrap();
    assert!(seen.is_root());
    assert_eq!(Context::current(), ctx);
}
