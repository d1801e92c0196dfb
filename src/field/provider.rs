// SPDX-License-Identifier: MIT OR Apache-2.0

//! Field kinds and the process-wide table provider.
//!
//! Every [`FieldKind`] gets its table from the installed [`FieldProvider`]. A
//! provider can be installed once, early; the first installation wins. If nothing
//! is installed by the time the first field is resolved, [`DefaultFieldProvider`]
//! is installed implicitly and later registrations are refused.

use std::any::TypeId;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use super::table::{FieldTable, ShardedTable, WeakKeyedTable};
use crate::error::FieldError;

/// Identifies one logical field: an (owner type, value type) pair.
///
/// Two fields over the same owner type but different value types are unrelated
/// and never see each other's entries.
#[derive(Copy, Clone, Debug)]
pub struct FieldKind {
    owner: TypeId,
    value: TypeId,
    owner_name: &'static str,
    value_name: &'static str,
}

impl FieldKind {
    /// The kind for owner type `O` and value type `V`.
    pub fn of<O: 'static, V: 'static>() -> Self {
        FieldKind {
            owner: TypeId::of::<O>(),
            value: TypeId::of::<V>(),
            owner_name: std::any::type_name::<O>(),
            value_name: std::any::type_name::<V>(),
        }
    }

    /// Name of the owner type, for diagnostics.
    pub fn owner_type_name(&self) -> &'static str {
        self.owner_name
    }

    /// Name of the value type, for diagnostics.
    pub fn value_type_name(&self) -> &'static str {
        self.value_name
    }
}

impl PartialEq for FieldKind {
    fn eq(&self, other: &Self) -> bool {
        self.owner == other.owner && self.value == other.value
    }
}

impl Eq for FieldKind {}

impl Hash for FieldKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.owner.hash(state);
        self.value.hash(state);
    }
}

/// Creates the table backing each [`FieldKind`].
pub trait FieldProvider: Send + Sync + 'static {
    /// A short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Creates the table for `kind`. Called at most once per kind.
    fn create_table(&self, kind: FieldKind) -> Arc<dyn FieldTable>;
}

/// One [`WeakKeyedTable`] per kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFieldProvider;

impl FieldProvider for DefaultFieldProvider {
    fn name(&self) -> &'static str {
        "default"
    }

    fn create_table(&self, _kind: FieldKind) -> Arc<dyn FieldTable> {
        Arc::new(WeakKeyedTable::new())
    }
}

/// One lock-striped [`ShardedTable`] per kind, for heavily contended fields.
#[derive(Debug, Clone, Copy)]
pub struct ShardedFieldProvider {
    shards: usize,
}

impl ShardedFieldProvider {
    /// A provider whose tables use `shards` shards each.
    pub fn new(shards: usize) -> Self {
        ShardedFieldProvider { shards }
    }
}

impl Default for ShardedFieldProvider {
    fn default() -> Self {
        ShardedFieldProvider::new(16)
    }
}

impl FieldProvider for ShardedFieldProvider {
    fn name(&self) -> &'static str {
        "sharded"
    }

    fn create_table(&self, _kind: FieldKind) -> Arc<dyn FieldTable> {
        Arc::new(ShardedTable::new(self.shards))
    }
}

static PROVIDER: OnceLock<Box<dyn FieldProvider>> = OnceLock::new();

/// Installs `provider` for the whole process.
///
/// Only the first installation takes effect. Once any field has been resolved the
/// default provider counts as installed. A refused registration changes nothing
/// and reports the provider that stays in effect; callers that do not care can
/// discard the error.
///
/// ```rust
/// use carrywise::field::{ShardedFieldProvider, register_field_provider};
///
/// // at startup, before any field is used
/// let _ = register_field_provider(ShardedFieldProvider::default());
/// ```
pub fn register_field_provider<P: FieldProvider>(provider: P) -> Result<(), FieldError> {
    let mut installed_now = false;
    let installed = PROVIDER.get_or_init(|| {
        installed_now = true;
        Box::new(provider)
    });
    if installed_now {
        logwise::debuginternal_sync!(
            "Installed field provider {name}",
            name = installed.name()
        );
        Ok(())
    } else {
        logwise::debuginternal_sync!(
            "Ignoring field provider registration: {name} is already installed",
            name = installed.name()
        );
        Err(FieldError::ProviderAlreadyInstalled {
            installed: installed.name(),
        })
    }
}

/// The provider in effect, installing the default one if none was registered.
pub fn field_provider() -> &'static dyn FieldProvider {
    PROVIDER
        .get_or_init(|| Box::new(DefaultFieldProvider))
        .as_ref()
}
