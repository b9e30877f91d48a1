//! Core types shared by lifetimes, collections and bridges.

pub mod id;
pub mod outcome;
pub mod status;

pub use id::LifetimeId;
pub use outcome::{ExecutionResult, Failure, PanicPayload};
pub use status::{LifetimeStatus, TerminationTimeoutKind};
