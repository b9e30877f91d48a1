//! Synchronous and asynchronous termination.
//!
//! Termination runs in three steps:
//!
//! 1. Mark the definition and its nested definitions `Canceling`. Guarded
//!    executions and registrations are refused from then on.
//! 2. Drain guarded executions. A synchronous terminator blocks for at most
//!    the configured timeout. An asynchronous terminator returns at once
//!    and the last exiting execution carries on.
//! 3. Advance `Canceling → Terminating`. Exactly one caller wins this CAS
//!    and unwinds the resource stack in LIFO order.
//!
//! Asynchronous unwinding never blocks. When a nested definition is still
//! draining, the unwinder parks itself as a continuation on that child's
//! termination signal and resumes on whichever thread completes the child.

use super::definition::DefinitionInner;
use super::handle::Lifetime;
use super::resources::Resource;
use super::state::{
    ALLOW_TERMINATION_UNDER_EXECUTION, ASYNC_TERMINATION_REQUESTED, LOG_ERROR_AFTER_EXECUTION,
};
use crate::config;
use crate::error::LifetimeError;
use crate::types::LifetimeStatus;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::Instant;

type Continuation = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct SignalState {
    complete: bool,
    wakers: Vec<Waker>,
    continuations: Vec<Continuation>,
}

/// One-shot completion signal raised when a definition reaches `Terminated`.
///
/// Supports blocking waiters, async waiters and continuations. All of them
/// are released together.
#[derive(Default)]
pub(crate) struct TerminationSignal {
    state: Mutex<SignalState>,
    condvar: Condvar,
}

impl TerminationSignal {
    pub(crate) fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    pub(crate) fn complete(&self) {
        let (wakers, continuations) = {
            let mut state = self.state.lock();
            if state.complete {
                return;
            }
            state.complete = true;
            (
                std::mem::take(&mut state.wakers),
                std::mem::take(&mut state.continuations),
            )
        };
        self.condvar.notify_all();
        for waker in wakers {
            waker.wake();
        }
        for continuation in continuations {
            continuation();
        }
    }

    pub(crate) fn wait(&self) {
        let mut state = self.state.lock();
        while !state.complete {
            self.condvar.wait(&mut state);
        }
    }

    /// Runs `continuation` on completion, or now if already complete.
    pub(crate) fn on_complete(&self, continuation: Continuation) {
        {
            let mut state = self.state.lock();
            if !state.complete {
                state.continuations.push(continuation);
                return;
            }
        }
        continuation();
    }

    fn poll_complete(&self, cx: &Context<'_>) -> Poll<()> {
        let mut state = self.state.lock();
        if state.complete {
            return Poll::Ready(());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[derive(Clone)]
enum Target {
    Ready,
    Never,
    Signal(Arc<DefinitionInner>),
}

/// Completes when a lifetime reaches `Terminated`.
///
/// Any number of futures may wait on the same lifetime; they all complete
/// together. The future for the eternal lifetime never completes.
#[derive(Clone)]
#[must_use = "futures do nothing unless polled"]
pub struct TerminationFuture {
    target: Target,
}

impl TerminationFuture {
    pub(crate) const fn ready() -> Self {
        Self {
            target: Target::Ready,
        }
    }

    pub(crate) const fn never() -> Self {
        Self {
            target: Target::Never,
        }
    }

    pub(crate) const fn for_definition(inner: Arc<DefinitionInner>) -> Self {
        Self {
            target: Target::Signal(inner),
        }
    }

    /// Returns true if the lifetime has terminated.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        match &self.target {
            Target::Ready => true,
            Target::Never => false,
            Target::Signal(inner) => inner.signal.is_complete(),
        }
    }

    /// Blocks the current thread until the lifetime has terminated.
    ///
    /// For the eternal lifetime this never returns.
    pub fn wait(self) {
        match self.target {
            Target::Ready => {}
            Target::Never => loop {
                thread::park();
            },
            Target::Signal(inner) => inner.signal.wait(),
        }
    }
}

impl Future for TerminationFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &self.target {
            Target::Ready => Poll::Ready(()),
            Target::Never => Poll::Pending,
            Target::Signal(inner) => inner.signal.poll_complete(cx),
        }
    }
}

impl fmt::Debug for TerminationFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.target {
            Target::Ready => "ready".to_string(),
            Target::Never => "never".to_string(),
            Target::Signal(inner) => inner.to_string(),
        };
        f.debug_struct("TerminationFuture")
            .field("target", &target)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnwindMode {
    Sync,
    Async,
}

/// Resumable LIFO walk over a taken resource stack.
struct Unwinder {
    inner: Arc<DefinitionInner>,
    slots: Vec<Resource>,
    mode: UnwindMode,
    allow: bool,
}

impl Unwinder {
    fn run(mut self) {
        self.inner.enter_unwinding();
        let lifetime = Lifetime::from_inner(Arc::clone(&self.inner));
        while let Some(resource) = self.slots.pop() {
            let index = self.slots.len();
            match resource {
                Resource::Nested(child) => match self.mode {
                    UnwindMode::Sync => child.terminate_nested(self.allow),
                    UnwindMode::Async => {
                        if child.terminate_nested_async(self.allow) {
                            self.inner.suspend_unwinding(&child);
                            tracing::trace!(
                                lifetime = %self.inner,
                                child = %child,
                                "unwinding suspended until nested lifetime terminates"
                            );
                            child.signal.on_complete(Box::new(move || self.run()));
                            return;
                        }
                    }
                },
                other => other.release(&lifetime, index),
            }
        }
        self.inner.finish_termination();
    }
}

impl DefinitionInner {
    /// `Alive → Canceling` for this definition and every nested one.
    pub(crate) fn mark_canceling_recursively(&self) {
        if !self.state.advance_status_from(LifetimeStatus::Alive) {
            return;
        }
        self.log_transition(LifetimeStatus::Canceling);
        fence(Ordering::SeqCst);
        if let Some(source) = self.cancellation.get() {
            source.cancel();
        }
        let children: SmallVec<[Arc<Self>; 4]> = self.resources.lock().nested().cloned().collect();
        for child in children.iter().rev() {
            child.mark_canceling_recursively();
        }
    }

    fn supports_termination_under_execution(&self, permission: bool, allowing: u32) -> bool {
        permission || allowing > 0 || self.state.load().has(ALLOW_TERMINATION_UNDER_EXECUTION)
    }

    /// Synchronous termination.
    ///
    /// When another caller is already unwinding, waits for it to finish if
    /// `wait_for_other` is set.
    pub(crate) fn terminate_with(
        self: &Arc<Self>,
        permission: bool,
        wait_for_other: bool,
    ) -> Result<(), LifetimeError> {
        if self.eternal {
            return Ok(());
        }
        if self.status() >= LifetimeStatus::Terminating {
            if wait_for_other {
                self.wait_for_termination();
            }
            return Ok(());
        }
        let own = self.threads.current();
        let supports = self.supports_termination_under_execution(permission, own.allowing);
        if own.executing > 0 && !supports {
            return Err(LifetimeError::InvalidOperation {
                lifetime: self.to_string(),
            });
        }

        self.mark_canceling_recursively();
        self.wait_for_executions(own.executing);

        if !self.state.advance_status_from(LifetimeStatus::Canceling) {
            if wait_for_other {
                self.wait_for_termination();
            }
            return Ok(());
        }
        let slots = self.begin_unwinding();
        Unwinder {
            inner: Arc::clone(self),
            slots,
            mode: UnwindMode::Sync,
            allow: supports,
        }
        .run();
        Ok(())
    }

    /// Requests asynchronous termination.
    ///
    /// Returns true if the caller should wait for this definition's signal
    /// to keep LIFO order, false if it already finished or another caller
    /// owns the unwinding.
    pub(crate) fn request_async_termination(
        self: &Arc<Self>,
        permission: bool,
    ) -> Result<bool, LifetimeError> {
        if self.eternal || self.status() >= LifetimeStatus::Terminating {
            return Ok(false);
        }
        let own = self.threads.current();
        let supports = self.supports_termination_under_execution(permission, own.allowing);
        if own.executing > 0 && !supports {
            return Err(LifetimeError::InvalidOperation {
                lifetime: self.to_string(),
            });
        }

        self.mark_canceling_recursively();
        {
            let mut request = self.async_request.lock();
            request.requested_at.get_or_insert_with(Instant::now);
            request.allow |= supports;
        }
        let after = self.state.set_flag(ASYNC_TERMINATION_REQUESTED, true);
        if after.executing() > own.executing {
            tracing::debug!(
                lifetime = %self,
                executing = after.executing(),
                "asynchronous termination waits for guarded executions"
            );
            return Ok(true);
        }
        let started = self.try_finish_async(own.executing);
        Ok(started && !self.signal.is_complete())
    }

    /// Starts unwinding if executions have drained and nobody else has.
    pub(crate) fn try_finish_async(self: &Arc<Self>, own_executing: u32) -> bool {
        let snapshot = self.state.load();
        if snapshot.executing() > own_executing {
            return false;
        }
        if !self.state.advance_status_from(LifetimeStatus::Canceling) {
            return false;
        }
        let (requested_at, allow) = {
            let request = self.async_request.lock();
            (request.requested_at, request.allow)
        };
        if let Some(requested_at) = requested_at {
            let waited = requested_at.elapsed();
            let timeout = config::global().timeout_for(snapshot.timeout_kind());
            if waited > timeout {
                tracing::warn!(
                    lifetime = %self,
                    waited_ms = waited.as_millis(),
                    timeout_ms = timeout.as_millis(),
                    "asynchronous termination waited longer than the termination timeout \
                     for guarded executions"
                );
            }
        }
        let slots = self.begin_unwinding();
        Unwinder {
            inner: Arc::clone(self),
            slots,
            mode: UnwindMode::Async,
            allow,
        }
        .run();
        true
    }

    fn terminate_nested(self: &Arc<Self>, allow: bool) {
        if let Err(error) = self.terminate_with(allow, false) {
            tracing::error!(lifetime = %self, error = %error, "failed to terminate nested lifetime");
        }
    }

    /// Returns true if the parent must wait for this child's signal.
    fn terminate_nested_async(self: &Arc<Self>, allow: bool) -> bool {
        match self.request_async_termination(allow) {
            Ok(pending) => pending,
            Err(error) => {
                tracing::error!(lifetime = %self, error = %error, "failed to terminate nested lifetime");
                false
            }
        }
    }

    fn wait_for_executions(&self, own_executing: u32) {
        let snapshot = self.state.load();
        if snapshot.executing() <= own_executing {
            return;
        }
        let kind = snapshot.timeout_kind();
        let timeout = config::global().timeout_for(kind);
        tracing::debug!(
            lifetime = %self,
            executing = snapshot.executing(),
            timeout_ms = timeout.as_millis(),
            "waiting for guarded executions to finish"
        );
        let deadline = Instant::now() + timeout;
        if !self
            .drain
            .wait_until(deadline, || self.state.load().executing() <= own_executing)
        {
            let after = self.state.set_flag(LOG_ERROR_AFTER_EXECUTION, true);
            tracing::warn!(
                lifetime = %self,
                executing = after.executing(),
                timeout_ms = timeout.as_millis(),
                timeout_kind = %kind,
                "guarded executions did not finish within the termination timeout; \
                 continuing termination"
            );
        }
    }

    /// Blocks until `Terminated`.
    ///
    /// Returns early on the thread that is unwinding, and on a thread whose
    /// guarded execution keeps a parked unwinding from resuming. Waiting
    /// there would never finish.
    pub(crate) fn wait_for_termination(&self) {
        if self.signal.is_complete() {
            return;
        }
        let mut parked_on = {
            let unwinding = self.unwinding.lock();
            if unwinding.thread == Some(thread::current().id()) {
                return;
            }
            unwinding.parked_on.clone()
        };
        while let Some(child) = parked_on {
            if child.threads.current().executing > 0 {
                tracing::trace!(
                    lifetime = %self,
                    child = %child,
                    "not waiting for termination from inside the execution it waits for"
                );
                return;
            }
            parked_on = child.unwinding.lock().parked_on.clone();
        }
        self.signal.wait();
    }

    fn begin_unwinding(&self) -> Vec<Resource> {
        self.log_transition(LifetimeStatus::Terminating);
        self.resources.lock().take()
    }

    fn enter_unwinding(&self) {
        let mut unwinding = self.unwinding.lock();
        unwinding.thread = Some(thread::current().id());
        unwinding.parked_on = None;
    }

    fn suspend_unwinding(&self, child: &Arc<Self>) {
        let mut unwinding = self.unwinding.lock();
        unwinding.thread = None;
        unwinding.parked_on = Some(Arc::clone(child));
    }

    fn finish_termination(&self) {
        self.resource_count.store(0, Ordering::Release);
        if !self.state.advance_status_from(LifetimeStatus::Terminating) {
            tracing::error!(lifetime = %self, "unwinding finished outside of Terminating");
        }
        {
            let mut unwinding = self.unwinding.lock();
            unwinding.thread = None;
            unwinding.parked_on = None;
        }
        self.log_transition(LifetimeStatus::Terminated);
        self.signal.complete();
    }
}
