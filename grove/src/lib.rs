//! The grove engine: plans the changes that bring real-world resources in
//! line with a configuration, and applies them through providers.
//!
//! The operations live on [`context::Context`]. Each builds a
//! [`graph::Graph`] of the work to do and evaluates it with
//! [`walk::walk`], one [`lifecycle`] step per vertex.

pub mod config;
pub mod context;
pub mod diagnostics;
pub mod eval;
pub mod graph;
pub mod hooks;
pub mod interrupt;
pub(crate) mod lifecycle;
pub mod providers;
pub mod state_sync;
pub mod walk;
