//! A chain of nested lifetimes where only the latest is alive.

use super::definition::LifetimeDefinition;
use super::handle::{Lifetime, terminate_logged};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};

/// Produces nested lifetimes of a parent one at a time.
///
/// Starting the next lifetime terminates the current one first, so at most
/// one lifetime of the sequence is alive at any time. Termination of the
/// parent terminates the current lifetime as well.
pub struct SequentialLifetimes {
    parent: Lifetime,
    current: Mutex<Option<LifetimeDefinition>>,
}

impl SequentialLifetimes {
    /// Creates an empty sequence under `parent`.
    #[must_use]
    pub fn new(parent: Lifetime) -> Self {
        Self {
            parent,
            current: Mutex::new(None),
        }
    }

    /// Terminates the current lifetime and starts a new one.
    ///
    /// If the parent is not alive the returned definition is terminated.
    pub fn next(&self) -> LifetimeDefinition {
        self.terminate_current();
        let next = self.parent.create_nested();
        self.install(next.clone());
        next
    }

    /// Like [`next`](Self::next), then runs `body` on the new lifetime
    /// under a guarded execution that permits termination.
    ///
    /// If `body` panics, the new lifetime is terminated and the panic
    /// propagates.
    pub fn next_with(&self, body: impl FnOnce(&Lifetime)) -> Lifetime {
        self.define_next(|definition| body(&definition.lifetime()))
            .lifetime()
    }

    /// Like [`next_with`](Self::next_with), handing `body` the definition.
    pub fn define_next(&self, body: impl FnOnce(&LifetimeDefinition)) -> LifetimeDefinition {
        let next = self.next();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let cookie = next.lifetime().using_execute_if_alive(true);
            if cookie.succeed() {
                body(&next);
            }
        }));
        if let Err(payload) = outcome {
            terminate_logged(&next);
            resume_unwind(payload);
        }
        next
    }

    /// Terminates the current lifetime, leaving the sequence empty.
    pub fn terminate_current(&self) {
        let current = self.current.lock().take();
        if let Some(current) = current {
            terminate_logged(&current);
        }
    }

    /// Returns the current lifetime, or the terminated one if empty.
    #[must_use]
    pub fn current(&self) -> Lifetime {
        self.current
            .lock()
            .as_ref()
            .map_or_else(Lifetime::terminated, LifetimeDefinition::lifetime)
    }

    /// Returns true if there is no alive current lifetime.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_none_or(|current| !current.is_alive())
    }

    fn install(&self, next: LifetimeDefinition) {
        let previous = self.current.lock().replace(next);
        if let Some(previous) = previous {
            tracing::trace!(
                lifetime = %previous,
                "concurrent `next` replaced a sequential lifetime; terminating it"
            );
            terminate_logged(&previous);
        }
    }
}

impl fmt::Debug for SequentialLifetimes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequentialLifetimes")
            .field("parent", &self.parent)
            .field("current", &self.current())
            .finish()
    }
}
