// SPDX-License-Identifier: MIT OR Apache-2.0

//! Propagation settings.
//!
//! Settings come from code (the builder methods on [`PropagationConfig`]) or from
//! the environment:
//!
//! | Variable                   | Meaning                                           | Default |
//! |----------------------------|---------------------------------------------------|---------|
//! | `CARRYWISE_ENABLED`        | propagate contexts at all                         | `true`  |
//! | `CARRYWISE_EXCLUDED_TASKS` | comma-separated task type names never propagated  | empty   |
//! | `CARRYWISE_STRICT_ROOT`    | warn when code tries to propagate the root context | `false` |

use std::collections::HashSet;

use crate::error::ConfigError;

/// Turns propagation on or off (boolean).
pub const ENABLED_VAR: &str = "CARRYWISE_ENABLED";
/// Comma-separated task type names that never receive a context.
pub const EXCLUDED_TASKS_VAR: &str = "CARRYWISE_EXCLUDED_TASKS";
/// Warns about attempts to propagate the root context (boolean).
pub const STRICT_ROOT_VAR: &str = "CARRYWISE_STRICT_ROOT";

/// Settings for a [`Propagator`](crate::propagation::Propagator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationConfig {
    enabled: bool,
    excluded_task_types: HashSet<String>,
    strict_root: bool,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        PropagationConfig {
            enabled: true,
            excluded_task_types: HashSet::new(),
            strict_root: false,
        }
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            var,
            value: value.to_string(),
        }),
    }
}

impl PropagationConfig {
    /// Reads settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Reads settings through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = PropagationConfig::default();
        if let Some(value) = lookup(ENABLED_VAR) {
            config.enabled = parse_bool(ENABLED_VAR, &value)?;
        }
        if let Some(value) = lookup(STRICT_ROOT_VAR) {
            config.strict_root = parse_bool(STRICT_ROOT_VAR, &value)?;
        }
        if let Some(value) = lookup(EXCLUDED_TASKS_VAR) {
            config.excluded_task_types = value
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(config)
    }

    /// Turns propagation on or off.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Never propagate into tasks whose [`task_type`](crate::task::Runnable::task_type) is `name`.
    pub fn exclude_task_type(mut self, name: impl Into<String>) -> Self {
        self.excluded_task_types.insert(name.into());
        self
    }

    /// Warn when the root context is offered for propagation.
    pub fn with_strict_root(mut self, strict_root: bool) -> Self {
        self.strict_root = strict_root;
        self
    }

    /// Whether contexts are propagated at all.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Whether offering the root context for propagation is logged.
    pub fn strict_root(&self) -> bool {
        self.strict_root
    }

    /// Whether `task_type` is on the exclusion list.
    pub fn is_excluded(&self, task_type: &str) -> bool {
        self.excluded_task_types.contains(task_type)
    }
}
