//! Packed atomic state word of a lifetime definition.
//!
//! A single `AtomicU64` carries everything that must change together:
//!
//! ```text
//!  63        40 39    38..37   36      35      34      33..32   31 ........ 0
//! ┌───────────┬──────┬────────┬───────┬───────┬───────┬────────┬────────────┐
//! │  unused   │async │timeout │verbose│late   │allow  │ status │ executing  │
//! └───────────┴──────┴────────┴───────┴───────┴───────┴────────┴────────────┘
//! ```
//!
//! Keeping the execution counter and the status in one word is what makes
//! "enter a guarded execution only while `Alive`" race-free against the
//! `Alive → Canceling` transition.

use crate::types::{LifetimeStatus, TerminationTimeoutKind};
use std::sync::atomic::{AtomicU64, Ordering};

const EXECUTING_MASK: u64 = 0xFFFF_FFFF;
const STATUS_SHIFT: u32 = 32;
const STATUS_MASK: u64 = 0b11 << STATUS_SHIFT;
const TIMEOUT_SHIFT: u32 = 37;
const TIMEOUT_MASK: u64 = 0b11 << TIMEOUT_SHIFT;

/// Termination under execution is allowed for this definition.
pub(crate) const ALLOW_TERMINATION_UNDER_EXECUTION: u64 = 1 << 34;
/// Termination proceeded while a guarded execution was still running.
pub(crate) const LOG_ERROR_AFTER_EXECUTION: u64 = 1 << 35;
/// Termination transitions are logged at debug level instead of trace.
pub(crate) const VERBOSE_DIAGNOSTICS: u64 = 1 << 36;
/// An asynchronous termination is waiting for guarded executions to drain.
pub(crate) const ASYNC_TERMINATION_REQUESTED: u64 = 1 << 39;

/// A copy of the state word at one instant.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Snapshot(u64);

impl Snapshot {
    #[inline]
    pub(crate) const fn executing(self) -> u32 {
        (self.0 & EXECUTING_MASK) as u32
    }

    #[inline]
    pub(crate) const fn status(self) -> LifetimeStatus {
        LifetimeStatus::from_bits(((self.0 & STATUS_MASK) >> STATUS_SHIFT) as u8)
    }

    #[inline]
    pub(crate) const fn timeout_kind(self) -> TerminationTimeoutKind {
        TerminationTimeoutKind::from_bits(((self.0 & TIMEOUT_MASK) >> TIMEOUT_SHIFT) as u8)
    }

    #[inline]
    pub(crate) const fn has(self, flag: u64) -> bool {
        self.0 & flag != 0
    }

    #[inline]
    const fn with_status(self, status: LifetimeStatus) -> Self {
        Self((self.0 & !STATUS_MASK) | ((status as u64) << STATUS_SHIFT))
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("status", &self.status())
            .field("executing", &self.executing())
            .field("timeout_kind", &self.timeout_kind())
            .field("allow", &self.has(ALLOW_TERMINATION_UNDER_EXECUTION))
            .field("late", &self.has(LOG_ERROR_AFTER_EXECUTION))
            .field("async", &self.has(ASYNC_TERMINATION_REQUESTED))
            .finish()
    }
}

/// The atomic state word.
pub(crate) struct State(AtomicU64);

impl State {
    pub(crate) const fn new(kind: TerminationTimeoutKind) -> Self {
        Self(AtomicU64::new((kind as u64) << TIMEOUT_SHIFT))
    }

    #[inline]
    pub(crate) fn load(&self) -> Snapshot {
        Snapshot(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn status(&self) -> LifetimeStatus {
        self.load().status()
    }

    /// Sets or clears `flag`, returning the word after the update.
    pub(crate) fn set_flag(&self, flag: u64, value: bool) -> Snapshot {
        let prev = if value {
            self.0.fetch_or(flag, Ordering::AcqRel)
        } else {
            self.0.fetch_and(!flag, Ordering::AcqRel)
        };
        Snapshot(if value { prev | flag } else { prev & !flag })
    }

    pub(crate) fn set_timeout_kind(&self, kind: TerminationTimeoutKind) {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = (current & !TIMEOUT_MASK) | ((kind as u64) << TIMEOUT_SHIFT);
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Increments the execution counter if the status is `Alive`.
    pub(crate) fn try_enter_execution(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let snapshot = Snapshot(current);
            if snapshot.status() != LifetimeStatus::Alive {
                return false;
            }
            assert!(
                u64::from(snapshot.executing()) < EXECUTING_MASK,
                "too many nested guarded executions"
            );
            match self.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Decrements the execution counter, returning the word after the update.
    pub(crate) fn exit_execution(&self) -> Snapshot {
        let prev = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(Snapshot(prev).executing() > 0, "execution counter underflow");
        Snapshot(prev - 1)
    }

    /// Moves the status one step forward if it currently equals `expected`.
    pub(crate) fn advance_status_from(&self, expected: LifetimeStatus) -> bool {
        let Some(next) = expected.next() else {
            return false;
        };
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let snapshot = Snapshot(current);
            if snapshot.status() != expected {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                snapshot.with_status(next).0,
                Ordering::SeqCst,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn status_advances_monotonically() {
        init_test("status_advances_monotonically");
        let state = State::new(TerminationTimeoutKind::Default);
        crate::assert_with_log!(
            state.status() == LifetimeStatus::Alive,
            "fresh state is alive",
            LifetimeStatus::Alive,
            state.status()
        );
        assert!(!state.advance_status_from(LifetimeStatus::Canceling));
        assert!(state.advance_status_from(LifetimeStatus::Alive));
        assert!(!state.advance_status_from(LifetimeStatus::Alive));
        assert!(state.advance_status_from(LifetimeStatus::Canceling));
        assert!(state.advance_status_from(LifetimeStatus::Terminating));
        assert!(!state.advance_status_from(LifetimeStatus::Terminated));
        crate::assert_with_log!(
            state.status() == LifetimeStatus::Terminated,
            "final status",
            LifetimeStatus::Terminated,
            state.status()
        );
        crate::test_complete!("status_advances_monotonically");
    }

    #[test]
    fn execution_counter_only_enters_while_alive() {
        init_test("execution_counter_only_enters_while_alive");
        let state = State::new(TerminationTimeoutKind::Long);
        assert!(state.try_enter_execution());
        assert!(state.try_enter_execution());
        assert_eq!(state.load().executing(), 2);

        assert!(state.advance_status_from(LifetimeStatus::Alive));
        assert!(!state.try_enter_execution());
        assert_eq!(state.exit_execution().executing(), 1);
        assert_eq!(state.exit_execution().executing(), 0);

        // Neighbouring fields are untouched by counter traffic.
        let snapshot = state.load();
        assert_eq!(snapshot.status(), LifetimeStatus::Canceling);
        assert_eq!(snapshot.timeout_kind(), TerminationTimeoutKind::Long);
        crate::test_complete!("execution_counter_only_enters_while_alive");
    }

    #[test]
    fn flags_and_timeout_kind_are_independent() {
        init_test("flags_and_timeout_kind_are_independent");
        let state = State::new(TerminationTimeoutKind::Default);
        let after = state.set_flag(ALLOW_TERMINATION_UNDER_EXECUTION, true);
        assert!(after.has(ALLOW_TERMINATION_UNDER_EXECUTION));
        assert!(!after.has(LOG_ERROR_AFTER_EXECUTION));

        state.set_timeout_kind(TerminationTimeoutKind::ExtraLong);
        let snapshot = state.load();
        assert_eq!(snapshot.timeout_kind(), TerminationTimeoutKind::ExtraLong);
        assert!(snapshot.has(ALLOW_TERMINATION_UNDER_EXECUTION));

        let cleared = state.set_flag(ALLOW_TERMINATION_UNDER_EXECUTION, false);
        assert!(!cleared.has(ALLOW_TERMINATION_UNDER_EXECUTION));
        assert_eq!(cleared.status(), LifetimeStatus::Alive);
        crate::test_complete!("flags_and_timeout_kind_are_independent");
    }
}
