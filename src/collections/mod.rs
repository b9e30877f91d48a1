//! Collections whose entries are scoped by lifetimes.

pub mod lifetimed_list;

pub use lifetimed_list::{Iter, LifetimedList};
