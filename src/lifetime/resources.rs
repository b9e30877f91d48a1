//! The LIFO resource stack owned by every lifetime definition.

use super::definition::DefinitionInner;
use super::handle::Lifetime;
use crate::types::PanicPayload;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// A value released when its lifetime terminates.
pub trait Disposable: Send {
    /// Releases the value. Called at most once.
    fn dispose(&mut self);
}

/// A callback told which lifetime is terminating.
///
/// Useful when one handler object is registered on many lifetimes.
pub trait TerminationHandler: Send + Sync {
    /// Called while `lifetime` is unwinding its resources.
    fn on_termination(&self, lifetime: &Lifetime);
}

impl<F: FnMut() + Send> Disposable for F {
    fn dispose(&mut self) {
        self();
    }
}

/// One entry of the resource stack.
pub(crate) enum Resource {
    Action(Box<dyn FnOnce() + Send>),
    Disposable(Box<dyn Disposable>),
    Handler(Arc<dyn TerminationHandler>),
    Nested(Arc<DefinitionInner>),
    /// Held only to keep the value alive until termination.
    KeepAlive(Box<dyn Any + Send>),
}

impl Resource {
    pub(crate) const fn kind(&self) -> &'static str {
        match self {
            Self::Action(_) => "action",
            Self::Disposable(_) => "disposable",
            Self::Handler(_) => "handler",
            Self::Nested(_) => "nested",
            Self::KeepAlive(_) => "keep-alive",
        }
    }

    /// Releases a non-nested resource, catching and logging any panic.
    ///
    /// Nested definitions are terminated by the unwinder instead.
    pub(crate) fn release(self, lifetime: &Lifetime, index: usize) {
        let kind = self.kind();
        let outcome = catch_unwind(AssertUnwindSafe(|| match self {
            Self::Action(action) => action(),
            Self::Disposable(mut disposable) => disposable.dispose(),
            Self::Handler(handler) => handler.on_termination(lifetime),
            Self::Nested(_) | Self::KeepAlive(_) => {}
        }));
        if let Err(payload) = outcome {
            let payload = PanicPayload::from_panic(payload.as_ref());
            tracing::error!(
                lifetime = %lifetime,
                slot = index,
                kind,
                error = %payload,
                "resource panicked during termination"
            );
        }
    }
}

/// Growable LIFO stack of resources.
///
/// Protected by the definition's resource mutex. Status checks for
/// registration happen under the same mutex.
pub(crate) struct ResourceStack {
    slots: Vec<Resource>,
}

impl ResourceStack {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::with_capacity(1),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Pushes `resource`, first dropping terminated nested definitions
    /// when the stack is full.
    pub(crate) fn push(&mut self, resource: Resource) {
        if self.slots.len() == self.slots.capacity() {
            self.compact();
        }
        self.slots.push(resource);
    }

    fn compact(&mut self) {
        let before = self.slots.len();
        self.slots.retain(|resource| match resource {
            Resource::Nested(child) => !child.status().is_terminated(),
            _ => true,
        });
        let removed = before - self.slots.len();
        if removed > 0 {
            tracing::trace!(removed, remaining = self.slots.len(), "compacted resource stack");
        }
    }

    /// Nested definitions currently on the stack, bottom to top.
    pub(crate) fn nested(&self) -> impl Iterator<Item = &Arc<DefinitionInner>> {
        self.slots.iter().filter_map(|resource| match resource {
            Resource::Nested(child) => Some(child),
            _ => None,
        })
    }

    /// Takes every resource out, leaving an empty stack with no storage.
    pub(crate) fn take(&mut self) -> Vec<Resource> {
        std::mem::take(&mut self.slots)
    }
}
