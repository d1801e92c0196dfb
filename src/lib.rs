//SPDX-License-Identifier: MIT OR Apache-2.0
/*!
# carrywise

carrywise attaches ambient context to code you don't own, and carries that context
across thread hand-offs.

# Development status

carrywise is experimental and the API may change.

# The problem

Instrumentation wants to know "which request is this?" everywhere. Within one
thread that is easy: keep the answer in a thread-local. It breaks down in two places.

* Work gets handed to an executor and runs later on a different thread, where the
  thread-local says something else (or nothing).
* The natural place to remember the answer is a field on somebody else's type
  (their task, their handle), and you can't add fields to somebody else's type.

# The pieces

| Module                 | Provides                                                              |
|------------------------|-----------------------------------------------------------------------|
| [`context`]            | [`Context`](context::Context), the current context, and scopes that restore it |
| [`field`]              | [`VirtualField`](field::VirtualField): side-table fields keyed by owner identity, never keeping the owner alive |
| [`task`]               | the [`Runnable`](task::Runnable) task abstraction and stable wrappers for closures |
| [`propagation`]        | the attach-on-submit, activate-on-run protocol                        |
| [`executor`]           | an executor adapter that runs the protocol for you                    |
| [`config`]             | settings, from code or from the environment                           |

# Example

```rust
use carrywise::context::Context;
use carrywise::propagation::Propagator;
use carrywise::task::RunnableRef;
use std::sync::Arc;

let propagator = Propagator::global();
let task: RunnableRef = Arc::new(|| {
    assert_eq!(Context::current().label(), Some("request-42"));
});

// submitting thread
let ctx = Context::root().child("request-42");
let attachment = propagator.attach(&ctx, &task);

// worker thread
std::thread::spawn(move || {
    let _scope = propagator.activate(attachment.slot());
    attachment.task().run();
})
.join()
.unwrap();
```

# Logging

carrywise logs through [logwise](https://docs.rs/logwise). Lost races are
`debuginternal`, suspicious conditions (scopes closed out of order, root contexts
offered for propagation in strict mode) are `warn`, and panics swallowed by the
interception hooks are `error`.
*/

logwise::declare_logging_domain!();

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod field;
pub mod propagation;
mod spinlock;
pub mod task;

pub use context::{ApplyContext, Context, Scope};
pub use error::{ConfigError, FieldError, TaskError};
pub use executor::{ContextPropagatingExecutor, Executor, TaskHandle};
pub use field::VirtualField;
pub use propagation::{PropagatedContext, Propagator};
pub use task::{Runnable, RunnableRef};

/// Serializes unit tests that install a global logger and read it back.
#[cfg(test)]
pub(crate) static TEST_LOGGER_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
