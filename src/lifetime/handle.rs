//! The observing side of a lifetime.

use super::definition::{DefinitionInner, LifetimeDefinition};
use super::resources::{Disposable, Resource, TerminationHandler};
use super::termination::TerminationFuture;
use crate::bridge::cancellation::CancellationToken;
use crate::error::LifetimeError;
use crate::types::{LifetimeId, LifetimeStatus, TerminationTimeoutKind};
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;

#[derive(Clone, Default)]
pub(crate) enum LifetimeKind {
    #[default]
    Eternal,
    Terminated,
    Owned(Arc<DefinitionInner>),
}

/// A read-only handle to a lifetime.
///
/// Handles are cheap to clone and can register cleanup, run guarded
/// executions and create nested lifetimes, but cannot terminate the
/// lifetime. That is reserved for the [`LifetimeDefinition`].
///
/// Two distinguished handles exist without a definition:
///
/// * [`Lifetime::eternal()`] is always alive. Registrations on it are
///   kept for the life of the process and never run.
/// * [`Lifetime::terminated()`] is already terminated and rejects
///   registrations.
///
/// The default handle is the eternal one.
#[derive(Clone, Default)]
pub struct Lifetime {
    pub(crate) kind: LifetimeKind,
}

impl Lifetime {
    /// The lifetime that never ends.
    #[must_use]
    pub const fn eternal() -> Self {
        Self {
            kind: LifetimeKind::Eternal,
        }
    }

    /// A lifetime that has already ended.
    #[must_use]
    pub const fn terminated() -> Self {
        Self {
            kind: LifetimeKind::Terminated,
        }
    }

    pub(crate) const fn from_inner(inner: Arc<DefinitionInner>) -> Self {
        Self {
            kind: LifetimeKind::Owned(inner),
        }
    }

    /// Returns the identifier of the backing definition, if any.
    #[must_use]
    pub fn id(&self) -> Option<LifetimeId> {
        match &self.kind {
            LifetimeKind::Owned(inner) => Some(inner.id),
            _ => None,
        }
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> LifetimeStatus {
        match &self.kind {
            LifetimeKind::Eternal => LifetimeStatus::Alive,
            LifetimeKind::Terminated => LifetimeStatus::Terminated,
            LifetimeKind::Owned(inner) => inner.status(),
        }
    }

    /// Returns true while `Alive`.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.status().is_alive()
    }

    /// Returns true once cancellation has begun.
    #[must_use]
    pub fn is_not_alive(&self) -> bool {
        !self.is_alive()
    }

    /// Returns true for the eternal lifetime.
    #[must_use]
    pub const fn is_eternal(&self) -> bool {
        matches!(self.kind, LifetimeKind::Eternal)
    }

    /// Returns the timeout kind of the backing definition.
    #[must_use]
    pub fn termination_timeout_kind(&self) -> TerminationTimeoutKind {
        match &self.kind {
            LifetimeKind::Owned(inner) => inner.state.load().timeout_kind(),
            _ => TerminationTimeoutKind::Default,
        }
    }

    /// Fails with `Canceled` unless the lifetime is alive.
    pub fn ensure_alive(&self) -> Result<(), LifetimeError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(self.canceled_error())
        }
    }

    fn register(&self, resource: Resource) -> Result<(), LifetimeError> {
        match &self.kind {
            LifetimeKind::Eternal => {
                keep_forever(resource);
                Ok(())
            }
            LifetimeKind::Terminated => Err(terminated_state_error()),
            LifetimeKind::Owned(inner) => inner.try_add(resource).map_err(|_| inner.not_alive_error()),
        }
    }

    /// Registers `resource`, releasing it immediately if the lifetime no
    /// longer accepts registrations.
    pub(crate) fn add_or_release(&self, resource: Resource) {
        let rejected = match &self.kind {
            LifetimeKind::Eternal => return keep_forever(resource),
            LifetimeKind::Terminated => resource,
            LifetimeKind::Owned(inner) => match inner.try_add(resource) {
                Ok(()) => return,
                Err(resource) => resource,
            },
        };
        rejected.release(self, 0);
    }

    pub(crate) fn canceled_error(&self) -> LifetimeError {
        match &self.kind {
            LifetimeKind::Owned(inner) => inner.canceled_error(),
            _ => LifetimeError::Canceled {
                lifetime: self.to_string(),
            },
        }
    }

    /// Registers `action` to run when the lifetime terminates.
    ///
    /// Fails with `InvalidState` if the lifetime is not alive; the action is
    /// dropped without running.
    pub fn on_termination<F>(&self, action: F) -> Result<(), LifetimeError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(Resource::Action(Box::new(action)))
    }

    /// Like [`on_termination`](Self::on_termination), returning false
    /// instead of failing.
    pub fn try_on_termination<F>(&self, action: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_termination(action).is_ok()
    }

    /// Registers `disposable` to be disposed when the lifetime terminates.
    pub fn add_dispose<D>(&self, disposable: D) -> Result<(), LifetimeError>
    where
        D: Disposable + 'static,
    {
        self.register(Resource::Disposable(Box::new(disposable)))
    }

    /// Like [`add_dispose`](Self::add_dispose), returning false instead of
    /// failing.
    pub fn try_add_dispose<D>(&self, disposable: D) -> bool
    where
        D: Disposable + 'static,
    {
        self.add_dispose(disposable).is_ok()
    }

    /// Registers a shared handler told which lifetime is terminating.
    pub fn add_handler(&self, handler: Arc<dyn TerminationHandler>) -> Result<(), LifetimeError> {
        self.register(Resource::Handler(handler))
    }

    /// Like [`add_handler`](Self::add_handler), returning false instead of
    /// failing.
    pub fn try_add_handler(&self, handler: Arc<dyn TerminationHandler>) -> bool {
        self.add_handler(handler).is_ok()
    }

    /// Keeps `value` alive until the lifetime terminates.
    pub fn keep_alive<V>(&self, value: V) -> Result<(), LifetimeError>
    where
        V: Any + Send,
    {
        self.register(Resource::KeepAlive(Box::new(value)))
    }

    /// Like [`keep_alive`](Self::keep_alive), returning false instead of
    /// failing.
    pub fn try_keep_alive<V>(&self, value: V) -> bool
    where
        V: Any + Send,
    {
        self.keep_alive(value).is_ok()
    }

    /// Creates a nested definition terminated no later than this lifetime.
    ///
    /// On the eternal lifetime the result is standalone. On a lifetime that
    /// is not alive the result is already terminated.
    #[must_use]
    pub fn create_nested(&self) -> LifetimeDefinition {
        match &self.kind {
            LifetimeKind::Eternal => LifetimeDefinition::new(),
            LifetimeKind::Terminated => {
                let definition = LifetimeDefinition::new();
                terminate_logged(&definition);
                definition
            }
            LifetimeKind::Owned(parent) => {
                let definition =
                    LifetimeDefinition::with_timeout_kind(parent.state.load().timeout_kind());
                parent.attach(definition.inner());
                definition
            }
        }
    }

    /// Creates a nested definition and runs `setup` on it under a guarded
    /// execution that permits termination.
    ///
    /// If `setup` panics, the nested definition is terminated and the panic
    /// propagates.
    pub fn create_nested_with(&self, setup: impl FnOnce(&LifetimeDefinition)) -> LifetimeDefinition {
        let definition = self.create_nested();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let cookie = definition.lifetime().using_execute_if_alive(true);
            if cookie.succeed() {
                setup(&definition);
            }
        }));
        if let Err(payload) = outcome {
            terminate_logged(&definition);
            resume_unwind(payload);
        }
        definition
    }

    /// Runs `action` with a fresh lifetime that is terminated afterwards,
    /// even if `action` panics.
    pub fn using<R>(action: impl FnOnce(&Self) -> R) -> R {
        let terminate = TerminateOnDrop(LifetimeDefinition::new());
        action(&terminate.0.lifetime())
    }

    /// Runs `action` with a nested lifetime that is terminated afterwards,
    /// even if `action` panics.
    pub fn using_nested<R>(&self, action: impl FnOnce(&Self) -> R) -> R {
        let terminate = TerminateOnDrop(self.create_nested());
        action(&terminate.0.lifetime())
    }

    /// Returns a lifetime that ends as soon as either input ends.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        if self == other || other.is_eternal() {
            return self.clone();
        }
        if self.is_eternal() {
            return other.clone();
        }
        Self::define_intersection(&[self.clone(), other.clone()]).lifetime()
    }

    /// Returns a definition nested in every lifetime of `lifetimes`.
    ///
    /// Its timeout kind is the minimum of the inputs'.
    #[must_use]
    pub fn define_intersection(lifetimes: &[Self]) -> LifetimeDefinition {
        let kind = lifetimes
            .iter()
            .map(Self::termination_timeout_kind)
            .min()
            .unwrap_or_default();
        let definition = LifetimeDefinition::with_timeout_kind(kind);
        for lifetime in lifetimes {
            match &lifetime.kind {
                LifetimeKind::Eternal => {}
                LifetimeKind::Terminated => terminate_logged(&definition),
                LifetimeKind::Owned(parent) => parent.attach(definition.inner()),
            }
        }
        definition
    }

    /// Completes when the lifetime reaches `Terminated`.
    ///
    /// Never completes for the eternal lifetime.
    pub fn await_termination(&self) -> TerminationFuture {
        match &self.kind {
            LifetimeKind::Eternal => TerminationFuture::never(),
            LifetimeKind::Terminated => TerminationFuture::ready(),
            LifetimeKind::Owned(inner) => TerminationFuture::for_definition(Arc::clone(inner)),
        }
    }

    /// Returns a token canceled when this lifetime stops being alive.
    ///
    /// The token for the eternal lifetime is never canceled; the token for
    /// the terminated lifetime is canceled already.
    #[must_use]
    pub fn to_cancellation_token(&self) -> CancellationToken {
        match &self.kind {
            LifetimeKind::Eternal => CancellationToken::none(),
            LifetimeKind::Terminated => CancellationToken::already_cancelled(),
            LifetimeKind::Owned(inner) => inner.cancellation_token(),
        }
    }
}

/// Parks `resource` on the eternal definition's stack, which never unwinds.
fn keep_forever(resource: Resource) {
    let eternal = LifetimeDefinition::eternal();
    if eternal.inner().try_add(resource).is_err() {
        tracing::error!("eternal lifetime refused a registration");
    }
}

fn terminated_state_error() -> LifetimeError {
    LifetimeError::InvalidState {
        lifetime: Lifetime::terminated().to_string(),
        diagnostic: None,
    }
}

pub(crate) fn terminate_logged(definition: &LifetimeDefinition) {
    if let Err(error) = definition.terminate() {
        tracing::error!(lifetime = %definition, error = %error, "failed to terminate lifetime");
    }
}

struct TerminateOnDrop(LifetimeDefinition);

impl Drop for TerminateOnDrop {
    fn drop(&mut self) {
        terminate_logged(&self.0);
    }
}

impl From<&LifetimeDefinition> for Lifetime {
    fn from(definition: &LifetimeDefinition) -> Self {
        definition.lifetime()
    }
}

impl PartialEq for Lifetime {
    fn eq(&self, other: &Self) -> bool {
        match (&self.kind, &other.kind) {
            (LifetimeKind::Eternal, LifetimeKind::Eternal)
            | (LifetimeKind::Terminated, LifetimeKind::Terminated) => true,
            (LifetimeKind::Owned(a), LifetimeKind::Owned(b)) => a.id == b.id,
            _ => false,
        }
    }
}

impl Eq for Lifetime {}

impl Hash for Lifetime {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
        self.is_eternal().hash(state);
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            LifetimeKind::Eternal => {
                f.write_str("Lifetime `Eternal` [Alive, executing=0, resources=0]")
            }
            LifetimeKind::Terminated => {
                f.write_str("Lifetime `Terminated` [Terminated, executing=0, resources=0]")
            }
            LifetimeKind::Owned(inner) => fmt::Display::fmt(&**inner, f),
        }
    }
}

impl fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Lifetime").field(&self.to_string()).finish()
    }
}
