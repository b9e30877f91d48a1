//! A single-assignment promise and its bridge to lifetimes.

use crate::lifetime::{Lifetime, LifetimeDefinition};
use crate::types::PanicPayload;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// The promise was cancelled instead of receiving a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("promise cancelled")]
pub struct PromiseCancelled;

type Callback = Box<dyn FnOnce() + Send>;

struct PromiseState<T> {
    outcome: Option<Result<T, PromiseCancelled>>,
    wakers: Vec<Waker>,
    callbacks: Vec<Callback>,
}

/// A value that is set at most once, either with a result or by
/// cancellation. The first writer wins.
pub struct Promise<T> {
    state: Arc<Mutex<PromiseState<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Send + 'static> Promise<T> {
    /// Creates an unset promise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PromiseState {
                outcome: None,
                wakers: Vec::new(),
                callbacks: Vec::new(),
            })),
        }
    }

    fn try_set(&self, outcome: Result<T, PromiseCancelled>) -> bool {
        let (wakers, callbacks) = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            (
                std::mem::take(&mut state.wakers),
                std::mem::take(&mut state.callbacks),
            )
        };
        for waker in wakers {
            waker.wake();
        }
        for callback in callbacks {
            run_callback(callback);
        }
        true
    }

    /// Sets the value. Returns false if the promise was already completed.
    pub fn try_set_result(&self, value: T) -> bool {
        self.try_set(Ok(value))
    }

    /// Cancels the promise. Returns false if it was already completed.
    pub fn try_cancel(&self) -> bool {
        self.try_set(Err(PromiseCancelled))
    }

    /// Returns true once a value was set or the promise was cancelled.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state.lock().outcome.is_some()
    }

    /// Returns true if the promise was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.state.lock().outcome, Some(Err(PromiseCancelled)))
    }

    /// Runs `callback` once the promise completes, or immediately if it
    /// already has.
    pub fn on_completion<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if state.outcome.is_none() {
                state.callbacks.push(Box::new(callback));
                return;
            }
        }
        run_callback(Box::new(callback));
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Returns the outcome if the promise has completed.
    #[must_use]
    pub fn result(&self) -> Option<Result<T, PromiseCancelled>> {
        self.state.lock().outcome.clone()
    }

    /// Completes with the outcome of the promise.
    pub fn wait(&self) -> PromiseFuture<T> {
        PromiseFuture {
            promise: self.clone(),
        }
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let status = match &state.outcome {
            None => "pending",
            Some(Ok(_)) => "completed",
            Some(Err(_)) => "cancelled",
        };
        f.debug_struct("Promise").field("status", &status).finish()
    }
}

fn run_callback(callback: Callback) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(callback)) {
        tracing::error!(
            error = %PanicPayload::from_panic(payload.as_ref()),
            "promise completion callback panicked"
        );
    }
}

/// Future returned by [`Promise::wait`].
#[must_use = "futures do nothing unless polled"]
pub struct PromiseFuture<T> {
    promise: Promise<T>,
}

impl<T: Clone> Future for PromiseFuture<T> {
    type Output = Result<T, PromiseCancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.promise.state.lock();
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl Lifetime {
    /// Creates a promise that is cancelled when this lifetime terminates.
    #[must_use]
    pub fn create_promise<T: Send + 'static>(&self) -> Promise<T> {
        let promise = Promise::new();
        let on_end = promise.clone();
        if !self.try_on_termination(move || {
            on_end.try_cancel();
        }) {
            promise.try_cancel();
        }
        promise
    }
}

impl LifetimeDefinition {
    /// Ties this definition and `promise` together.
    ///
    /// Terminating the definition cancels the promise; completing the
    /// promise in any way terminates the definition. Whichever happens
    /// first wins. If the definition is already not alive the promise is
    /// cancelled now; if the promise is already completed the definition
    /// is terminated now.
    pub fn synchronize_with<T: Send + 'static>(&self, promise: &Promise<T>) {
        let lifetime = self.lifetime();
        {
            let cookie = lifetime.using_execute_if_alive(true);
            if !cookie.succeed() {
                promise.try_cancel();
                return;
            }
            if !promise.is_completed() {
                let on_end = promise.clone();
                let registered = lifetime.try_on_termination(move || {
                    on_end.try_cancel();
                });
                if !registered {
                    promise.try_cancel();
                    return;
                }
            }
        }
        let definition = self.clone();
        promise.on_completion(move || {
            if let Err(error) = definition.terminate() {
                tracing::error!(lifetime = %definition, error = %error, "failed to terminate synchronized lifetime");
            }
        });
    }
}
