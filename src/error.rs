//! Error types for lifetime operations.
//!
//! Errors carry the display form of the lifetime they concern, so they can
//! outlive the definition and cross thread boundaries freely.

use crate::types::Failure;

/// The kind of a [`LifetimeError`], for matching without destructuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A registration was attempted on a lifetime that is not alive.
    InvalidState,
    /// Termination was requested from inside an execution that forbids it.
    InvalidOperation,
    /// The lifetime was canceled.
    Canceled,
    /// A guarded action failed on its own.
    Failed,
}

/// Errors produced by lifetime operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LifetimeError {
    /// A registration was attempted on a lifetime that is not alive.
    #[error(
        "{lifetime}: can't add a termination action because the lifetime is not alive; \
         use the `try_` variant to avoid this error{}",
        diagnostic_suffix(.diagnostic.as_deref())
    )]
    InvalidState {
        /// Display form of the lifetime.
        lifetime: String,
        /// Extra context recorded by an earlier overdue termination.
        diagnostic: Option<String>,
    },
    /// Termination was requested from inside a guarded execution of the same
    /// lifetime on the same thread, without permission.
    #[error(
        "{lifetime}: can't terminate from inside a guarded execution on the same thread; \
         enable `allow_termination_under_execution` to permit it"
    )]
    InvalidOperation {
        /// Display form of the lifetime.
        lifetime: String,
    },
    /// The lifetime was canceled.
    #[error("{lifetime}: canceled")]
    Canceled {
        /// Display form of the lifetime.
        lifetime: String,
    },
    /// A guarded action failed while the lifetime stayed alive.
    #[error(transparent)]
    Failed(#[from] Failure),
}

/// Result alias for lifetime operations.
pub type Result<T, E = LifetimeError> = std::result::Result<T, E>;

fn diagnostic_suffix(diagnostic: Option<&str>) -> String {
    diagnostic.map_or_else(String::new, |d| format!(" ({d})"))
}

impl LifetimeError {
    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::InvalidOperation { .. } => ErrorKind::InvalidOperation,
            Self::Canceled { .. } => ErrorKind::Canceled,
            Self::Failed(_) => ErrorKind::Failed,
        }
    }

    /// Returns true if this is a cancellation.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }

    /// Returns the overdue-termination diagnostic, if one was attached.
    #[must_use]
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::InvalidState { diagnostic, .. } => diagnostic.as_deref(),
            _ => None,
        }
    }
}
