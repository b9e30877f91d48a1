//! Identifiers for lifetimes.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_LIFETIME_ID: AtomicU64 = AtomicU64::new(1);

/// A process-unique identifier for a lifetime definition.
///
/// Identifiers are allocated from a monotonic counter and never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LifetimeId(u64);

impl LifetimeId {
    /// Allocates a fresh identifier.
    #[must_use]
    pub(crate) fn next() -> Self {
        Self(NEXT_LIFETIME_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for LifetimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LifetimeId({})", self.0)
    }
}

impl fmt::Display for LifetimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}
