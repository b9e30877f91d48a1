//! Lifecycle status and termination timeout kinds.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a lifetime.
///
/// Transitions only move forward:
///
/// ```text
/// Alive ──► Canceling ──► Terminating ──► Terminated
/// ```
///
/// * `Alive`: registrations and guarded executions are accepted.
/// * `Canceling`: no new guarded executions; running ones are drained.
/// * `Terminating`: the resource stack is being unwound.
/// * `Terminated`: every resource has been released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum LifetimeStatus {
    /// The lifetime accepts work.
    Alive = 0,
    /// Cancellation has been requested.
    Canceling = 1,
    /// Resources are being released.
    Terminating = 2,
    /// All resources have been released.
    Terminated = 3,
}

impl LifetimeStatus {
    pub(crate) const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Alive,
            1 => Self::Canceling,
            2 => Self::Terminating,
            _ => Self::Terminated,
        }
    }

    /// Returns the status that follows this one, if any.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Alive => Some(Self::Canceling),
            Self::Canceling => Some(Self::Terminating),
            Self::Terminating => Some(Self::Terminated),
            Self::Terminated => None,
        }
    }

    /// Returns true for `Alive`.
    #[inline]
    #[must_use]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Alive)
    }

    /// Returns true once resource release has finished.
    #[inline]
    #[must_use]
    pub const fn is_terminated(self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl fmt::Display for LifetimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Alive => "Alive",
            Self::Canceling => "Canceling",
            Self::Terminating => "Terminating",
            Self::Terminated => "Terminated",
        };
        f.write_str(name)
    }
}

/// How long a synchronous termination waits for guarded executions
/// before continuing with a warning.
///
/// Kinds are ordered from the shortest-lived intent to the longest:
/// intersections of several lifetimes use the minimum.
/// The concrete durations come from [`TerminationConfig`](crate::config::TerminationConfig).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum TerminationTimeoutKind {
    /// The default wait.
    #[default]
    Default = 0,
    /// A shorter wait for cheap scopes.
    Short = 1,
    /// A longer wait for scopes running heavy work.
    Long = 2,
    /// The longest configured wait.
    ExtraLong = 3,
}

impl TerminationTimeoutKind {
    pub(crate) const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Default,
            1 => Self::Short,
            2 => Self::Long,
            _ => Self::ExtraLong,
        }
    }
}

impl fmt::Display for TerminationTimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Default => "default",
            Self::Short => "short",
            Self::Long => "long",
            Self::ExtraLong => "extra-long",
        };
        f.write_str(name)
    }
}
