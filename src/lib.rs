//! Lifetimes: scoped resource ownership and cooperative cancellation.
//!
//! # Overview
//!
//! A lifetime is a scope that owns resources and ends exactly once. Code
//! registers cleanup on a lifetime; when the lifetime terminates, every
//! registered item is released in reverse order of registration. Lifetimes
//! nest, so a child scope is always torn down no later than its parent.
//!
//! # Core Guarantees
//!
//! - **Exactly-once teardown**: each registered resource is released once,
//!   even under concurrent termination requests
//! - **LIFO order**: resources are released in reverse registration order,
//!   nested lifetimes included
//! - **Drain before release**: termination waits (bounded) for guarded
//!   executions running under the lifetime before releasing anything
//! - **Cancellation first**: the status becomes `Canceling` and cancellation
//!   tokens fire before the first resource is released
//!
//! # Module Structure
//!
//! - [`types`]: Core types (status, identifiers, execution results)
//! - [`lifetime`]: Definitions, handles, guarded execution, termination
//! - [`collections`]: Lifetime-scoped collections
//! - [`bridge`]: Cancellation tokens and promises tied to lifetimes
//! - [`config`]: Termination timeout configuration
//! - [`error`](mod@error): Error types
//!
//! # Example
//!
//! ```
//! use lifetimes::LifetimeDefinition;
//! use std::sync::{Arc, Mutex};
//!
//! let order = Arc::new(Mutex::new(Vec::new()));
//! let def = LifetimeDefinition::new();
//! for i in 1..=3 {
//!     let order = Arc::clone(&order);
//!     def.lifetime()
//!         .on_termination(move || order.lock().unwrap().push(i))
//!         .unwrap();
//! }
//! def.terminate().unwrap();
//! assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod bridge;
pub mod collections;
pub mod config;
pub mod error;
pub mod lifetime;
#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;
pub mod types;

pub use bridge::{CancellationToken, Promise, PromiseCancelled};
pub use collections::LifetimedList;
pub use config::TerminationConfig;
pub use error::{ErrorKind, LifetimeError};
pub use lifetime::{
    Disposable, ExecutionCookie, Lifetime, LifetimeDefinition, SequentialLifetimes,
    TerminationFuture, TerminationHandler,
};
pub use types::{
    ExecutionResult, Failure, LifetimeId, LifetimeStatus, PanicPayload, TerminationTimeoutKind,
};
