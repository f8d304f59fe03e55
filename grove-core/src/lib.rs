//! Internal data model shared by the grove crates.
//!
//! Nothing in here performs I/O. The reconciler in [`objchange`] is a pure
//! function over [`value::Value`]s and may be called from any thread.

pub mod addrs;
pub mod objchange;
pub mod plans;
pub mod schema;
pub mod states;
pub mod value;
