//! Three-valued result of a guarded execution.
//!
//! - `Succeed(T)`: the action ran to completion
//! - `Canceled(LifetimeError)`: the lifetime was not alive, or the action
//!   failed because the lifetime was canceled while it ran
//! - `FailedNotCanceled(Failure)`: the action failed on its own
//!
//! Cancellation is a normal outcome here, not an error the caller must
//! special-case.

use crate::error::LifetimeError;
use core::fmt;
use std::any::Any;
use std::error::Error;
use std::sync::Arc;

/// Payload from a caught panic.
#[derive(Debug, Clone)]
pub struct PanicPayload {
    message: String,
}

impl PanicPayload {
    /// Creates a new panic payload with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Extracts a message from the value handed to `catch_unwind`.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { message }
    }

    /// Returns the panic message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

/// Why a guarded action failed without being canceled.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Failure {
    /// The action panicked.
    #[error("{0}")]
    Panicked(PanicPayload),
    /// The action returned an error.
    #[error("{0}")]
    Error(Arc<dyn Error + Send + Sync>),
}

impl Failure {
    /// Wraps an application error.
    pub fn from_error<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::Error(Arc::new(error))
    }

    /// Returns true if the action panicked.
    #[must_use]
    pub const fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }
}

/// The result of running an action under a lifetime's execution guard.
#[derive(Debug, Clone)]
#[must_use = "an execution result may be canceled and should be inspected"]
pub enum ExecutionResult<T> {
    /// The action completed and produced a value.
    Succeed(T),
    /// The lifetime was not alive, or was canceled while the action failed.
    Canceled(LifetimeError),
    /// The action failed while the lifetime stayed alive.
    FailedNotCanceled(Failure),
}

impl<T> ExecutionResult<T> {
    /// Returns true if the action completed.
    #[must_use]
    pub const fn is_succeed(&self) -> bool {
        matches!(self, Self::Succeed(_))
    }

    /// Returns true if the result is `Canceled`.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled(_))
    }

    /// Returns true if the result is `FailedNotCanceled`.
    #[must_use]
    pub const fn is_failed_not_canceled(&self) -> bool {
        matches!(self, Self::FailedNotCanceled(_))
    }

    /// Returns the value if the action completed.
    pub fn value(self) -> Option<T> {
        match self {
            Self::Succeed(v) => Some(v),
            _ => None,
        }
    }

    /// Maps the success value.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> ExecutionResult<U> {
        match self {
            Self::Succeed(v) => ExecutionResult::Succeed(f(v)),
            Self::Canceled(e) => ExecutionResult::Canceled(e),
            Self::FailedNotCanceled(e) => ExecutionResult::FailedNotCanceled(e),
        }
    }

    /// Converts into a standard `Result`.
    pub fn into_result(self) -> Result<T, LifetimeError> {
        match self {
            Self::Succeed(v) => Ok(v),
            Self::Canceled(e) => Err(e),
            Self::FailedNotCanceled(f) => Err(LifetimeError::Failed(f)),
        }
    }
}

impl<T> From<ExecutionResult<T>> for Result<T, LifetimeError> {
    fn from(result: ExecutionResult<T>) -> Self {
        result.into_result()
    }
}
