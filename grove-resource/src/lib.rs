//! The boundary between the grove engine and the outside world: the
//! capability interface that providers implement, and the on-disk state file.

pub mod provider;
pub mod state;
