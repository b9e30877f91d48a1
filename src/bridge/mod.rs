//! Bridges between lifetimes and other cancellation primitives.

pub mod cancellation;
pub mod promise;

pub use cancellation::{CancellationToken, Cancelled};
pub use promise::{Promise, PromiseCancelled, PromiseFuture};
