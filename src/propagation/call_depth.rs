// SPDX-License-Identifier: MIT OR Apache-2.0

//! Re-entrancy tracking for layered executors.
//!
//! An executor often forwards to another (or to itself through an overload). Only
//! the outermost submission on a thread should attach a context; the nested ones
//! would just race on the same task.

use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;

thread_local! {
    static DEPTHS: RefCell<HashMap<TypeId, usize>> = RefCell::new(HashMap::new());
}

/// Per-thread nesting counter for one executor type.
#[derive(Debug, Clone, Copy)]
pub struct CallDepth {
    key: TypeId,
}

impl CallDepth {
    /// The counter for executor type `E`.
    pub fn for_type<E: 'static>() -> Self {
        CallDepth {
            key: TypeId::of::<E>(),
        }
    }

    /// Enters one level. The level is left when the guard drops.
    pub fn enter(self) -> CallDepthGuard {
        let depth = DEPTHS
            .try_with(|depths| {
                let mut depths = depths.borrow_mut();
                let depth = depths.entry(self.key).or_insert(0);
                *depth += 1;
                *depth
            })
            // thread teardown: treat as outermost, nothing to decrement later
            .unwrap_or(1);
        CallDepthGuard {
            key: self.key,
            depth,
            _not_send: PhantomData,
        }
    }

    /// The current nesting level on this thread.
    pub fn current(self) -> usize {
        DEPTHS
            .try_with(|depths| depths.borrow().get(&self.key).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

/// One level of [`CallDepth`].
#[derive(Debug)]
#[must_use = "the level is left as soon as the guard drops"]
pub struct CallDepthGuard {
    key: TypeId,
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl CallDepthGuard {
    /// Whether this guard is the outermost level.
    pub fn is_outermost(&self) -> bool {
        self.depth == 1
    }

    /// The level this guard holds, starting at 1.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Drop for CallDepthGuard {
    fn drop(&mut self) {
        let _ = DEPTHS.try_with(|depths| {
            let mut depths = depths.borrow_mut();
            if let Some(depth) = depths.get_mut(&self.key) {
                *depth = depth.saturating_sub(1);
                if *depth == 0 {
                    depths.remove(&self.key);
                }
            }
        });
    }
}
