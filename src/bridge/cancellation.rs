//! Cancellation tokens derived from lifetimes.
//!
//! A token is a cheap, clonable view of "has this lifetime begun
//! terminating?". It is cancelled in the same step that moves the lifetime
//! from `Alive` to `Canceling`, before any resource is released.

use crate::types::PanicPayload;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, Waker};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Waiters {
    wakers: Vec<Waker>,
    callbacks: Vec<Callback>,
}

/// Shared cancellation state behind one or more tokens.
#[derive(Default)]
pub(crate) struct CancellationSource {
    cancelled: AtomicBool,
    waiters: Mutex<Waiters>,
}

impl CancellationSource {
    /// Cancels the source. Only the first call has an effect.
    pub(crate) fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let (wakers, callbacks) = {
            let mut waiters = self.waiters.lock();
            (
                std::mem::take(&mut waiters.wakers),
                std::mem::take(&mut waiters.callbacks),
            )
        };
        for waker in wakers {
            waker.wake();
        }
        for callback in callbacks {
            run_callback(callback);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn register(&self, callback: Callback) {
        {
            let mut waiters = self.waiters.lock();
            if !self.is_cancelled() {
                waiters.callbacks.push(callback);
                return;
            }
        }
        run_callback(callback);
    }

    fn poll_cancelled(&self, cx: &Context<'_>) -> Poll<()> {
        let mut waiters = self.waiters.lock();
        if self.is_cancelled() {
            return Poll::Ready(());
        }
        if !waiters.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            waiters.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

fn run_callback(callback: Callback) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(callback)) {
        tracing::error!(
            error = %PanicPayload::from_panic(payload.as_ref()),
            "cancellation callback panicked"
        );
    }
}

/// A read-only view of a lifetime's cancellation.
#[derive(Clone, Default)]
pub struct CancellationToken {
    source: Option<Arc<CancellationSource>>,
}

impl CancellationToken {
    /// A token that is never cancelled.
    #[must_use]
    pub const fn none() -> Self {
        Self { source: None }
    }

    /// A token that is already cancelled.
    #[must_use]
    pub fn already_cancelled() -> Self {
        static CANCELLED: OnceLock<Arc<CancellationSource>> = OnceLock::new();
        let source = CANCELLED.get_or_init(|| {
            let source = Arc::new(CancellationSource::default());
            source.cancel();
            source
        });
        Self {
            source: Some(Arc::clone(source)),
        }
    }

    pub(crate) const fn from_source(source: Arc<CancellationSource>) -> Self {
        Self {
            source: Some(source),
        }
    }

    /// Returns true once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.source.as_ref().is_some_and(|s| s.is_cancelled())
    }

    /// Returns false for a token that can never be cancelled.
    #[must_use]
    pub const fn can_be_cancelled(&self) -> bool {
        self.source.is_some()
    }

    /// Runs `callback` once the token is cancelled, or immediately if it
    /// already is. Callbacks on a token that can never be cancelled are
    /// dropped.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(source) = &self.source {
            source.register(Box::new(callback));
        }
    }

    /// Completes when the token is cancelled.
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            source: self.source.clone(),
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("can_be_cancelled", &self.can_be_cancelled())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Future returned by [`CancellationToken::cancelled`].
#[must_use = "futures do nothing unless polled"]
pub struct Cancelled {
    source: Option<Arc<CancellationSource>>,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &self.source {
            Some(source) => source.poll_cancelled(cx),
            None => Poll::Pending,
        }
    }
}
