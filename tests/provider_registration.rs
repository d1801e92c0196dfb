// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provider registration is process-wide, so it gets its own test binary.

use carrywise::error::FieldError;
use carrywise::field::{
    DefaultFieldProvider, ShardedFieldProvider, VirtualField, field_provider,
    register_field_provider,
};
use std::sync::Arc;

struct Session;

#[test]
fn first_registration_wins() {
    register_field_provider(ShardedFieldProvider::new(4)).unwrap();
    assert_eq!(field_provider().name(), "sharded");

    let err = register_field_provider(DefaultFieldProvider).unwrap_err();
    assert!(matches!(
        err,
        FieldError::ProviderAlreadyInstalled {
            installed: "sharded"
        }
    ));
    assert_eq!(field_provider().name(), "sharded");

    // fields resolved afterwards use the registered provider's tables
    let tags = VirtualField::<Arc<Session>, u32>::find();
    let session = Arc::new(Session);
    assert_eq!(tags.compute_if_absent(&session, || 7), 7);
    assert_eq!(tags.get(&session), Some(7));
    drop(session);
    assert_eq!(tags.len(), 0);
}
