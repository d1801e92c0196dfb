// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types.

/// Errors raised by the virtual field store.
#[derive(Debug, thiserror::Error)]
pub enum FieldError {
    /// A field provider was already installed (explicitly, or by first use of the default).
    #[error("field provider `{installed}` is already installed")]
    ProviderAlreadyInstalled {
        /// Name of the provider that stays in effect.
        installed: &'static str,
    },
}

/// Errors raised while reading [`PropagationConfig`](crate::config::PropagationConfig).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A boolean setting had a value other than `true`/`false`/`1`/`0`.
    #[error("{var} must be a boolean, got `{value}`")]
    InvalidBool {
        /// The variable that was read.
        var: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Why a [`TaskHandle`](crate::executor::TaskHandle) produced no value.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum TaskError {
    /// The task was cancelled before it started.
    #[error("task was cancelled before it ran")]
    Cancelled,
    /// The task body panicked.
    #[error("task panicked")]
    Panicked,
}
