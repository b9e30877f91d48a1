//! Lifetime definitions: the controlling side of a lifetime.

use super::execution::{DrainSignal, ThreadRegistry};
use super::handle::Lifetime;
use super::resources::{Resource, ResourceStack};
use super::state::{
    ALLOW_TERMINATION_UNDER_EXECUTION, LOG_ERROR_AFTER_EXECUTION, State, VERBOSE_DIAGNOSTICS,
};
use super::termination::{TerminationFuture, TerminationSignal};
use crate::bridge::cancellation::{CancellationSource, CancellationToken};
use crate::config;
use crate::error::LifetimeError;
use crate::types::{LifetimeId, LifetimeStatus, TerminationTimeoutKind};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering, fence};
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;
use std::time::Instant;

/// Who is unwinding a definition's resource stack right now.
#[derive(Default)]
pub(crate) struct UnwindingState {
    pub(crate) thread: Option<ThreadId>,
    /// Set while asynchronous unwinding waits for this nested definition.
    pub(crate) parked_on: Option<Arc<DefinitionInner>>,
}

#[derive(Default)]
pub(crate) struct AsyncRequest {
    pub(crate) requested_at: Option<Instant>,
    pub(crate) allow: bool,
}

/// State shared by a definition and all of its handles.
pub(crate) struct DefinitionInner {
    pub(crate) id: LifetimeId,
    pub(crate) eternal: bool,
    pub(crate) name: Mutex<Option<String>>,
    pub(crate) state: State,
    pub(crate) resources: Mutex<ResourceStack>,
    pub(crate) resource_count: AtomicUsize,
    pub(crate) threads: ThreadRegistry,
    pub(crate) drain: DrainSignal,
    pub(crate) signal: TerminationSignal,
    pub(crate) unwinding: Mutex<UnwindingState>,
    pub(crate) async_request: Mutex<AsyncRequest>,
    pub(crate) cancellation: OnceLock<Arc<CancellationSource>>,
    pub(crate) termination_assertion: Mutex<Option<String>>,
}

impl DefinitionInner {
    fn new(kind: TerminationTimeoutKind, eternal: bool) -> Arc<Self> {
        Arc::new(Self {
            id: LifetimeId::next(),
            eternal,
            name: Mutex::new(None),
            state: State::new(kind),
            resources: Mutex::new(ResourceStack::new()),
            resource_count: AtomicUsize::new(0),
            threads: ThreadRegistry::default(),
            drain: DrainSignal::default(),
            signal: TerminationSignal::default(),
            unwinding: Mutex::new(UnwindingState::default()),
            async_request: Mutex::new(AsyncRequest::default()),
            cancellation: OnceLock::new(),
            termination_assertion: Mutex::new(None),
        })
    }

    #[inline]
    pub(crate) fn status(&self) -> LifetimeStatus {
        self.state.status()
    }

    /// Pushes `resource` if the definition is alive; hands it back otherwise.
    pub(crate) fn try_add(&self, resource: Resource) -> Result<(), Resource> {
        let mut stack = self.resources.lock();
        if !self.status().is_alive() {
            return Err(resource);
        }
        stack.push(resource);
        self.resource_count.store(stack.len(), Ordering::Release);
        Ok(())
    }

    /// Registers `child` as a nested definition, or terminates it right away
    /// when this definition is no longer alive.
    pub(crate) fn attach(&self, child: &Arc<Self>) {
        if !child.status().is_alive() {
            return;
        }
        if self.try_add(Resource::Nested(Arc::clone(child))).is_err() {
            tracing::trace!(parent = %self, child = %child, "parent not alive; terminating nested lifetime");
            if let Err(error) = child.terminate_with(false, true) {
                tracing::error!(lifetime = %child, error = %error, "failed to terminate nested lifetime");
            }
        }
    }

    pub(crate) fn not_alive_error(&self) -> LifetimeError {
        let diagnostic = self
            .state
            .load()
            .has(LOG_ERROR_AFTER_EXECUTION)
            .then(|| {
                let kind = self.state.load().timeout_kind();
                format!(
                    "termination overran the {kind} timeout of {} ms while guarded executions were running",
                    config::global().timeout_for(kind).as_millis()
                )
            });
        LifetimeError::InvalidState {
            lifetime: self.to_string(),
            diagnostic,
        }
    }

    pub(crate) fn canceled_error(&self) -> LifetimeError {
        LifetimeError::Canceled {
            lifetime: self.to_string(),
        }
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        let source = Arc::clone(
            self.cancellation
                .get_or_init(|| Arc::new(CancellationSource::default())),
        );
        fence(Ordering::SeqCst);
        if !self.status().is_alive() {
            source.cancel();
        }
        CancellationToken::from_source(source)
    }

    pub(crate) fn log_transition(&self, status: LifetimeStatus) {
        if self.state.load().has(VERBOSE_DIAGNOSTICS) {
            tracing::debug!(lifetime = %self, status = %status, "lifetime status changed");
        } else {
            tracing::trace!(lifetime = %self, status = %status, "lifetime status changed");
        }
    }
}

impl fmt::Display for DefinitionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.state.load();
        let resources = self.resource_count.load(Ordering::Acquire);
        match self.name.lock().as_deref() {
            Some(name) => write!(f, "Lifetime `{name}`")?,
            None => write!(f, "Lifetime `{}`", self.id)?,
        }
        write!(
            f,
            " [{}, executing={}, resources={resources}]",
            snapshot.status(),
            snapshot.executing()
        )
    }
}

impl Drop for DefinitionInner {
    fn drop(&mut self) {
        if let Some(comment) = self.termination_assertion.get_mut().take() {
            if !self.state.status().is_terminated() {
                tracing::error!(
                    lifetime = %self,
                    comment = %comment,
                    "lifetime definition dropped without being terminated"
                );
            }
        }
    }
}

/// The controlling side of a lifetime.
///
/// A definition owns the resource stack and is the only way to terminate
/// it. Handles obtained through [`lifetime`](Self::lifetime) can observe
/// the lifetime and register work on it, but not end it.
///
/// Clones share the same lifetime. Dropping a definition does not
/// terminate it.
#[derive(Clone)]
pub struct LifetimeDefinition {
    inner: Arc<DefinitionInner>,
}

static ETERNAL: OnceLock<LifetimeDefinition> = OnceLock::new();

impl LifetimeDefinition {
    /// Creates a standalone alive definition with the default timeout kind.
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout_kind(TerminationTimeoutKind::Default)
    }

    /// Creates a standalone alive definition with the given timeout kind.
    #[must_use]
    pub fn with_timeout_kind(kind: TerminationTimeoutKind) -> Self {
        Self {
            inner: DefinitionInner::new(kind, false),
        }
    }

    /// The definition of the eternal lifetime. Terminating it does nothing.
    #[must_use]
    pub fn eternal() -> Self {
        ETERNAL
            .get_or_init(|| Self {
                inner: DefinitionInner::new(TerminationTimeoutKind::Default, true),
            })
            .clone()
    }

    pub(crate) const fn inner(&self) -> &Arc<DefinitionInner> {
        &self.inner
    }

    /// Sets a human-readable name used in logs and errors.
    #[must_use]
    pub fn with_id(self, name: impl Into<String>) -> Self {
        self.set_id(name);
        self
    }

    /// Sets a human-readable name used in logs and errors.
    pub fn set_id(&self, name: impl Into<String>) {
        *self.inner.name.lock() = Some(name.into());
    }

    /// Returns the unique identifier.
    #[must_use]
    pub fn id(&self) -> LifetimeId {
        self.inner.id
    }

    /// Returns the handle for this definition.
    #[must_use]
    pub fn lifetime(&self) -> Lifetime {
        if self.inner.eternal {
            Lifetime::eternal()
        } else {
            Lifetime::from_inner(Arc::clone(&self.inner))
        }
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> LifetimeStatus {
        self.inner.status()
    }

    /// Returns true while `Alive`.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.status().is_alive()
    }

    /// Number of guarded executions currently running.
    #[must_use]
    pub fn executing_count(&self) -> u32 {
        self.inner.state.load().executing()
    }

    /// Returns true if termination from inside a guarded execution is allowed.
    #[must_use]
    pub fn allow_termination_under_execution(&self) -> bool {
        self.inner
            .state
            .load()
            .has(ALLOW_TERMINATION_UNDER_EXECUTION)
    }

    /// Allows or forbids termination from inside a guarded execution.
    pub fn set_allow_termination_under_execution(&self, allow: bool) {
        self.inner
            .state
            .set_flag(ALLOW_TERMINATION_UNDER_EXECUTION, allow);
    }

    /// Returns the timeout kind used when draining guarded executions.
    #[must_use]
    pub fn termination_timeout_kind(&self) -> TerminationTimeoutKind {
        self.inner.state.load().timeout_kind()
    }

    /// Sets the timeout kind used when draining guarded executions.
    pub fn set_termination_timeout_kind(&self, kind: TerminationTimeoutKind) {
        self.inner.state.set_timeout_kind(kind);
    }

    /// Logs status transitions of this lifetime at debug level.
    pub fn enable_termination_logging(&self) {
        self.inner.state.set_flag(VERBOSE_DIAGNOSTICS, true);
    }

    /// Logs an error if this definition is dropped before it terminates.
    pub fn assert_ever_terminated(&self, comment: impl Into<String>) {
        *self.inner.termination_assertion.lock() = Some(comment.into());
    }

    /// Terminates the lifetime and blocks until its resources are released.
    ///
    /// Idempotent. When another thread is already unwinding, waits for it.
    /// Fails with `InvalidOperation` when called from inside a guarded
    /// execution of this lifetime on the same thread without permission.
    pub fn terminate(&self) -> Result<(), LifetimeError> {
        self.inner.terminate_with(false, true)
    }

    /// Like [`terminate`](Self::terminate), treating the call as permitted
    /// under execution when `allow` is set.
    pub fn terminate_with_permission(&self, allow: bool) -> Result<(), LifetimeError> {
        self.inner.terminate_with(allow, true)
    }

    /// Starts termination without blocking.
    ///
    /// Resources are released once running guarded executions finish. The
    /// returned future completes when the lifetime reaches `Terminated`.
    /// Fails synchronously with `InvalidOperation` under the same
    /// condition as [`terminate`](Self::terminate).
    pub fn terminate_async(&self) -> Result<TerminationFuture, LifetimeError> {
        if self.inner.eternal {
            return Ok(TerminationFuture::ready());
        }
        self.inner.request_async_termination(false)?;
        Ok(TerminationFuture::for_definition(Arc::clone(&self.inner)))
    }

    /// Terminates every definition in `definitions` as soon as any one of
    /// them terminates.
    pub fn synchronize(definitions: &[Self]) {
        for definition in definitions {
            for other in definitions {
                if !Arc::ptr_eq(&definition.inner, &other.inner) {
                    definition.inner.attach(&other.inner);
                }
            }
        }
    }
}

impl Default for LifetimeDefinition {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for LifetimeDefinition {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for LifetimeDefinition {}

impl std::hash::Hash for LifetimeDefinition {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Display for LifetimeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inner.eternal {
            return fmt::Display::fmt(&Lifetime::eternal(), f);
        }
        fmt::Display::fmt(&*self.inner, f)
    }
}

impl fmt::Debug for LifetimeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LifetimeDefinition")
            .field(&self.to_string())
            .finish()
    }
}
