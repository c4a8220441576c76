use std::{fmt, mem};

type DropFn = Box<dyn FnOnce() + Send>;

/// Resource scope of a unit.
///
/// A [`Constructor`](crate::Constructor) receives a scope and registers a
/// callback for every resource it acquires (timers, subscriptions, handles).
/// Callbacks run in reverse order of registration when the unit is retired,
/// when construction fails, or when the scope is dropped.
#[derive(Default)]
pub struct Scope {
    drops: Vec<DropFn>,
}

impl Scope {
    /// Create an empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function that will be called when this scope is released.
    pub fn use_drop(&mut self, f: impl FnOnce() + Send + 'static) {
        self.drops.push(Box::new(f));
    }

    /// Number of pending drop callbacks.
    pub fn len(&self) -> usize {
        self.drops.len()
    }

    /// Returns `true` if no drop callbacks are registered.
    pub fn is_empty(&self) -> bool {
        self.drops.is_empty()
    }

    /// Run every registered callback, newest first.
    pub(crate) fn release(&mut self) {
        for f in mem::take(&mut self.drops).into_iter().rev() {
            f();
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("drops", &self.drops.len())
            .finish()
    }
}
