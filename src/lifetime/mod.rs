//! Lifetimes: scoped resource ownership with cooperative cancellation.
//!
//! A [`LifetimeDefinition`] owns a LIFO stack of resources and controls
//! termination. A [`Lifetime`] is the read-only handle handed to code that
//! registers cleanup or runs guarded work.
//!
//! # Status machine
//!
//! ```text
//! Alive ──terminate──► Canceling ──drained──► Terminating ──unwound──► Terminated
//! ```
//!
//! Nested definitions are terminated as resources of their parent, so a
//! child never outlives it.

mod definition;
mod execution;
mod handle;
mod resources;
mod sequential;
mod state;
mod termination;

pub(crate) use definition::DefinitionInner;
pub use definition::LifetimeDefinition;
pub use execution::{AttachedFuture, ExecutionCookie};
pub use handle::Lifetime;
pub use resources::{Disposable, TerminationHandler};
pub use sequential::SequentialLifetimes;
pub use termination::TerminationFuture;
