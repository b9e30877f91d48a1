//! Execution guards.
//!
//! A guarded execution holds a lifetime's execution counter above zero.
//! While any guarded execution runs, termination waits (bounded by the
//! configured timeout) before unwinding resources, so an action never
//! observes its resources being released underneath it.
//!
//! Each definition also records which threads are inside its guards.
//! That per-definition registry is what lets `terminate` detect a call
//! from inside its own guard on the same thread.

use super::definition::DefinitionInner;
use super::handle::{Lifetime, LifetimeKind};
use super::resources::Resource;
use super::state::{ASYNC_TERMINATION_REQUESTED, LOG_ERROR_AFTER_EXECUTION};
use crate::error::LifetimeError;
use crate::types::{ExecutionResult, Failure, PanicPayload};
use parking_lot::{Condvar, Mutex};
use pin_project::pin_project;
use smallvec::SmallVec;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::thread::{self, ThreadId};
use std::time::Instant;

#[derive(Clone, Copy)]
struct ThreadEntry {
    thread: ThreadId,
    executing: u32,
    allowing: u32,
}

/// Guarded executions of the calling thread within one definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ThreadExecutions {
    pub(crate) executing: u32,
    pub(crate) allowing: u32,
}

/// Per-definition record of which threads are inside guarded executions.
#[derive(Default)]
pub(crate) struct ThreadRegistry {
    entries: Mutex<SmallVec<[ThreadEntry; 2]>>,
}

impl ThreadRegistry {
    pub(crate) fn enter(&self, allow: bool) {
        let thread = thread::current().id();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.thread == thread) {
            entry.executing += 1;
            entry.allowing += u32::from(allow);
        } else {
            entries.push(ThreadEntry {
                thread,
                executing: 1,
                allowing: u32::from(allow),
            });
        }
    }

    pub(crate) fn exit(&self, allow: bool) {
        let thread = thread::current().id();
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|e| e.thread == thread) {
            let entry = &mut entries[pos];
            entry.executing -= 1;
            entry.allowing -= u32::from(allow);
            if entry.executing == 0 {
                entries.swap_remove(pos);
            }
        }
    }

    pub(crate) fn current(&self) -> ThreadExecutions {
        let thread = thread::current().id();
        self.entries
            .lock()
            .iter()
            .find(|e| e.thread == thread)
            .map_or_else(ThreadExecutions::default, |e| ThreadExecutions {
                executing: e.executing,
                allowing: e.allowing,
            })
    }
}

/// Wakes synchronous terminators waiting for guarded executions to drain.
#[derive(Default)]
pub(crate) struct DrainSignal {
    lock: Mutex<()>,
    condvar: Condvar,
}

impl DrainSignal {
    pub(crate) fn notify(&self) {
        let _guard = self.lock.lock();
        self.condvar.notify_all();
    }

    /// Waits until `drained` holds or `deadline` passes; returns `drained()`.
    pub(crate) fn wait_until(&self, deadline: Instant, mut drained: impl FnMut() -> bool) -> bool {
        let mut guard = self.lock.lock();
        while !drained() {
            if self.condvar.wait_until(&mut guard, deadline).timed_out() {
                return drained();
            }
        }
        true
    }
}

impl DefinitionInner {
    pub(crate) fn enter_execution(&self, allow: bool, track_thread: bool) -> bool {
        if !self.state.try_enter_execution() {
            return false;
        }
        if track_thread {
            self.threads.enter(allow);
        }
        true
    }

    pub(crate) fn exit_execution(self: &Arc<Self>, allow: bool, track_thread: bool) {
        if track_thread {
            self.threads.exit(allow);
        }
        let after = self.state.exit_execution();
        if after.has(LOG_ERROR_AFTER_EXECUTION) {
            tracing::error!(
                lifetime = %self,
                "guarded execution finished after the termination timeout; \
                 resources were released while it was still running"
            );
        }
        if after.status().is_alive() {
            return;
        }
        self.drain.notify();
        if after.executing() == 0 && after.has(ASYNC_TERMINATION_REQUESTED) {
            self.try_finish_async(0);
        }
    }
}

/// A scoped guarded execution.
///
/// Obtained from [`Lifetime::using_execute_if_alive`]. While a cookie with
/// `succeed() == true` is alive, the lifetime cannot finish terminating.
/// The cookie is bound to the thread that created it.
#[must_use = "the guarded execution ends when the cookie is dropped"]
pub struct ExecutionCookie {
    inner: Option<Arc<DefinitionInner>>,
    allow: bool,
    succeed: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl ExecutionCookie {
    const fn new(inner: Option<Arc<DefinitionInner>>, allow: bool, succeed: bool) -> Self {
        Self {
            inner,
            allow,
            succeed,
            _thread_bound: PhantomData,
        }
    }

    /// Returns true if the execution was entered.
    #[must_use]
    pub const fn succeed(&self) -> bool {
        self.succeed
    }
}

impl Drop for ExecutionCookie {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.exit_execution(self.allow, true);
        }
    }
}

impl fmt::Debug for ExecutionCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionCookie")
            .field("succeed", &self.succeed)
            .field("allow", &self.allow)
            .finish_non_exhaustive()
    }
}

/// Guard held by a future running under a lifetime. Not bound to a thread.
struct DetachedGuard {
    inner: Arc<DefinitionInner>,
}

impl Drop for DetachedGuard {
    fn drop(&mut self) {
        self.inner.exit_execution(false, false);
    }
}

/// A future that keeps its lifetime's guarded execution open until it
/// completes or is dropped.
#[pin_project]
#[must_use = "futures do nothing unless polled"]
pub struct AttachedFuture<F> {
    #[pin]
    future: F,
    guard: Option<DetachedGuard>,
}

impl<F: Future> Future for AttachedFuture<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let output = ready!(this.future.poll(cx));
        this.guard.take();
        Poll::Ready(output)
    }
}

impl Lifetime {
    /// Enters a guarded execution if the lifetime is alive.
    ///
    /// With `allow_termination_under_execution`, code running under the
    /// returned cookie may terminate this lifetime on the same thread.
    pub fn using_execute_if_alive(&self, allow_termination_under_execution: bool) -> ExecutionCookie {
        match &self.kind {
            LifetimeKind::Eternal => ExecutionCookie::new(None, allow_termination_under_execution, true),
            LifetimeKind::Terminated => {
                ExecutionCookie::new(None, allow_termination_under_execution, false)
            }
            LifetimeKind::Owned(inner) => {
                if inner.enter_execution(allow_termination_under_execution, true) {
                    ExecutionCookie::new(Some(Arc::clone(inner)), allow_termination_under_execution, true)
                } else {
                    ExecutionCookie::new(None, allow_termination_under_execution, false)
                }
            }
        }
    }

    /// Runs `action` under the guard if alive, returning `None` otherwise.
    ///
    /// Panics in `action` propagate after the guard is released.
    pub fn execute_if_alive<T>(&self, action: impl FnOnce() -> T) -> Option<T> {
        let cookie = self.using_execute_if_alive(false);
        cookie.succeed().then(action)
    }

    /// Runs `action` under the guard.
    ///
    /// Returns `Canceled` if the lifetime is not alive. With `wrap_panics`, a
    /// panic becomes `FailedNotCanceled`, or `Canceled` if the lifetime
    /// stopped being alive meanwhile. Without it the panic propagates.
    pub fn try_execute<T>(&self, action: impl FnOnce() -> T, wrap_panics: bool) -> ExecutionResult<T> {
        let cookie = self.using_execute_if_alive(false);
        if !cookie.succeed() {
            return ExecutionResult::Canceled(self.canceled_error());
        }
        if !wrap_panics {
            return ExecutionResult::Succeed(action());
        }
        match catch_unwind(AssertUnwindSafe(action)) {
            Ok(value) => ExecutionResult::Succeed(value),
            Err(payload) => self.failure_result(Failure::Panicked(PanicPayload::from_panic(payload.as_ref()))),
        }
    }

    /// Like [`try_execute`](Self::try_execute) for actions returning `Result`.
    ///
    /// An `Err` is reported as `FailedNotCanceled`, or `Canceled` if the
    /// lifetime stopped being alive meanwhile.
    pub fn try_execute_result<T, E>(
        &self,
        action: impl FnOnce() -> Result<T, E>,
        wrap_panics: bool,
    ) -> ExecutionResult<T>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match self.try_execute(action, wrap_panics) {
            ExecutionResult::Succeed(Ok(value)) => ExecutionResult::Succeed(value),
            ExecutionResult::Succeed(Err(error)) => self.failure_result(Failure::from_error(error)),
            ExecutionResult::Canceled(e) => ExecutionResult::Canceled(e),
            ExecutionResult::FailedNotCanceled(f) => ExecutionResult::FailedNotCanceled(f),
        }
    }

    /// Runs `action` under the guard, failing with `Canceled` if not alive.
    pub fn execute<T>(&self, action: impl FnOnce() -> T) -> Result<T, LifetimeError> {
        let cookie = self.using_execute_if_alive(false);
        if !cookie.succeed() {
            return Err(self.canceled_error());
        }
        Ok(action())
    }

    /// Runs `opening` under the guard and registers `closing` for termination.
    ///
    /// If `opening` panics, `closing` runs immediately and the panic
    /// propagates. If the lifetime stopped accepting registrations while
    /// `opening` ran, `closing` runs immediately instead of being registered.
    /// Either way `closing` runs exactly once.
    pub fn bracket<T, C>(&self, opening: impl FnOnce() -> T, closing: C) -> Result<T, LifetimeError>
    where
        C: FnOnce() + Send + 'static,
    {
        let cookie = self.using_execute_if_alive(false);
        if !cookie.succeed() {
            return Err(self.canceled_error());
        }
        let value = match catch_unwind(AssertUnwindSafe(opening)) {
            Ok(value) => value,
            Err(payload) => {
                closing();
                resume_unwind(payload)
            }
        };
        self.add_or_release(Resource::Action(Box::new(closing)));
        drop(cookie);
        Ok(value)
    }

    /// Like [`bracket`](Self::bracket), handing `closing` a clone of the
    /// opened value.
    ///
    /// If `opening` panics there is no value, so `closing` does not run.
    pub fn bracket_with<T, C>(&self, opening: impl FnOnce() -> T, closing: C) -> Result<T, LifetimeError>
    where
        T: Clone + Send + 'static,
        C: FnOnce(T) + Send + 'static,
    {
        let cookie = self.using_execute_if_alive(false);
        if !cookie.succeed() {
            return Err(self.canceled_error());
        }
        let value = opening();
        let held = value.clone();
        self.add_or_release(Resource::Action(Box::new(move || closing(held))));
        drop(cookie);
        Ok(value)
    }

    /// Fallible [`bracket`](Self::bracket).
    ///
    /// When `opening` fails (or panics, with `wrap_panics`), `closing` runs
    /// immediately and the failure is reported in the result.
    pub fn try_bracket<T, E, C>(
        &self,
        opening: impl FnOnce() -> Result<T, E>,
        closing: C,
        wrap_panics: bool,
    ) -> ExecutionResult<T>
    where
        E: std::error::Error + Send + Sync + 'static,
        C: FnOnce() + Send + 'static,
    {
        let cookie = self.using_execute_if_alive(false);
        if !cookie.succeed() {
            return ExecutionResult::Canceled(self.canceled_error());
        }
        let opened = if wrap_panics {
            match catch_unwind(AssertUnwindSafe(opening)) {
                Ok(opened) => opened,
                Err(payload) => {
                    closing();
                    let failure = Failure::Panicked(PanicPayload::from_panic(payload.as_ref()));
                    return self.failure_result(failure);
                }
            }
        } else {
            match catch_unwind(AssertUnwindSafe(opening)) {
                Ok(opened) => opened,
                Err(payload) => {
                    closing();
                    resume_unwind(payload)
                }
            }
        };
        match opened {
            Ok(value) => {
                self.add_or_release(Resource::Action(Box::new(closing)));
                drop(cookie);
                ExecutionResult::Succeed(value)
            }
            Err(error) => {
                closing();
                self.failure_result(Failure::from_error(error))
            }
        }
    }

    /// Wraps `future` so the lifetime stays in a guarded execution until the
    /// future completes or is dropped.
    ///
    /// Fails with `Canceled` if the lifetime is not alive.
    pub fn execute_async<F: Future>(&self, future: F) -> Result<AttachedFuture<F>, LifetimeError> {
        let guard = match &self.kind {
            LifetimeKind::Eternal => None,
            LifetimeKind::Terminated => return Err(self.canceled_error()),
            LifetimeKind::Owned(inner) => {
                if !inner.enter_execution(false, false) {
                    return Err(self.canceled_error());
                }
                Some(DetachedGuard {
                    inner: Arc::clone(inner),
                })
            }
        };
        Ok(AttachedFuture { future, guard })
    }

    fn failure_result<T>(&self, failure: Failure) -> ExecutionResult<T> {
        if self.is_alive() {
            ExecutionResult::FailedNotCanceled(failure)
        } else {
            tracing::debug!(lifetime = %self, error = %failure, "action failed after cancellation");
            ExecutionResult::Canceled(self.canceled_error())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifetime::LifetimeDefinition;
    use crate::test_utils::{block_on, init_test_logging, poll_once};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn registry_tracks_nesting_per_thread() {
        init_test("registry_tracks_nesting_per_thread");
        let registry = ThreadRegistry::default();
        registry.enter(false);
        registry.enter(true);
        assert_eq!(
            registry.current(),
            ThreadExecutions {
                executing: 2,
                allowing: 1
            }
        );

        let seen_elsewhere = thread::scope(|s| s.spawn(|| registry.current()).join().expect("join"));
        assert_eq!(seen_elsewhere, ThreadExecutions::default());

        registry.exit(true);
        registry.exit(false);
        assert_eq!(registry.current(), ThreadExecutions::default());
        assert!(registry.entries.lock().is_empty());
        crate::test_complete!("registry_tracks_nesting_per_thread");
    }

    #[test]
    fn cookie_counts_and_releases() {
        init_test("cookie_counts_and_releases");
        let def = LifetimeDefinition::new();
        let lifetime = def.lifetime();
        {
            let outer = lifetime.using_execute_if_alive(false);
            let inner = lifetime.using_execute_if_alive(true);
            assert!(outer.succeed() && inner.succeed());
            assert_eq!(def.executing_count(), 2);
        }
        assert_eq!(def.executing_count(), 0);

        def.terminate().expect("terminate");
        let late = lifetime.using_execute_if_alive(false);
        crate::assert_with_log!(!late.succeed(), "cookie after termination", false, late.succeed());
        crate::test_complete!("cookie_counts_and_releases");
    }

    #[test]
    fn try_execute_wraps_panics_and_errors() {
        init_test("try_execute_wraps_panics_and_errors");
        let def = LifetimeDefinition::new();
        let lifetime = def.lifetime();

        crate::assert_succeed!(lifetime.try_execute(|| 7, false), 7);

        let panicked = lifetime.try_execute(|| -> u32 { panic!("inside") }, true);
        match panicked {
            ExecutionResult::FailedNotCanceled(Failure::Panicked(p)) => assert_eq!(p.message(), "inside"),
            other => unreachable!("expected panic failure, got {other:?}"),
        }

        let failed = lifetime.try_execute_result(|| Err::<u32, _>(io::Error::other("bad input")), true);
        assert!(failed.is_failed_not_canceled());
        assert_eq!(def.executing_count(), 0);

        def.terminate().expect("terminate");
        crate::assert_canceled!(lifetime.try_execute(|| 1, true));
        assert!(lifetime.execute(|| 1).is_err_and(|e| e.is_canceled()));
        assert_eq!(lifetime.execute_if_alive(|| 1), None);
        crate::test_complete!("try_execute_wraps_panics_and_errors");
    }

    #[test]
    fn failure_after_termination_reports_canceled() {
        init_test("failure_after_termination_reports_canceled");
        let def = LifetimeDefinition::new();
        def.set_allow_termination_under_execution(true);
        let lifetime = def.lifetime();
        let result = lifetime.try_execute(
            || -> u32 {
                def.terminate().expect("allowed under execution");
                panic!("resource went away");
            },
            true,
        );
        crate::assert_canceled!(result);
        assert!(def.status().is_terminated());
        crate::test_complete!("failure_after_termination_reports_canceled");
    }

    #[test]
    fn bracket_runs_closing_on_termination() {
        init_test("bracket_runs_closing_on_termination");
        let def = LifetimeDefinition::new();
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let value = def
            .lifetime()
            .bracket(|| "opened", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("alive");
        assert_eq!(value, "opened");
        assert_eq!(closed.load(Ordering::SeqCst), 0);
        def.terminate().expect("terminate");
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        crate::test_complete!("bracket_runs_closing_on_termination");
    }

    #[test]
    fn bracket_closes_once_when_opening_panics() {
        init_test("bracket_closes_once_when_opening_panics");
        let def = LifetimeDefinition::new();
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let lifetime = def.lifetime();
        let result = catch_unwind(AssertUnwindSafe(|| {
            lifetime.bracket(
                || -> u32 { panic!("open failed") },
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            )
        }));
        assert!(result.is_err());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(def.executing_count(), 0);
        def.terminate().expect("terminate");
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        crate::test_complete!("bracket_closes_once_when_opening_panics");
    }

    #[test]
    fn bracket_closes_immediately_when_terminated_during_opening() {
        init_test("bracket_closes_immediately_when_terminated_during_opening");
        let def = LifetimeDefinition::new();
        def.set_allow_termination_under_execution(true);
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let lifetime = def.lifetime();
        let value = lifetime
            .bracket(
                || {
                    def.terminate().expect("allowed under execution");
                    5
                },
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            )
            .expect("entered while alive");
        assert_eq!(value, 5);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        crate::test_complete!("bracket_closes_immediately_when_terminated_during_opening");
    }

    #[test]
    fn try_bracket_closes_on_error() {
        init_test("try_bracket_closes_on_error");
        let def = LifetimeDefinition::new();
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let result = def.lifetime().try_bracket(
            || Err::<u32, _>(io::Error::other("connect refused")),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        assert!(result.is_failed_not_canceled());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        crate::test_complete!("try_bracket_closes_on_error");
    }

    #[test]
    fn bracket_with_passes_value_to_closing() {
        init_test("bracket_with_passes_value_to_closing");
        let def = LifetimeDefinition::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let value = def
            .lifetime()
            .bracket_with(|| 42_u32, move |v| sink.lock().push(v))
            .expect("alive");
        assert_eq!(value, 42);
        def.terminate().expect("terminate");
        assert_eq!(*seen.lock(), vec![42]);
        crate::test_complete!("bracket_with_passes_value_to_closing");
    }

    #[test]
    fn attached_future_holds_guard_until_ready() {
        init_test("attached_future_holds_guard_until_ready");
        let def = LifetimeDefinition::new();
        let mut pending_once = Box::pin(async {
            futures_lite::future::yield_now().await;
            9
        });
        let mut attached = Box::pin(def.lifetime().execute_async(&mut pending_once).expect("alive"));
        assert!(poll_once(&mut attached).is_pending());
        assert_eq!(def.executing_count(), 1);
        assert_eq!(block_on(attached), 9);
        assert_eq!(def.executing_count(), 0);

        def.terminate().expect("terminate");
        assert!(def.lifetime().execute_async(async {}).is_err());
        crate::test_complete!("attached_future_holds_guard_until_ready");
    }
}
