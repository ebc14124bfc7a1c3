//! Order and position management: the per-user lifecycle manager and the
//! orchestrator task that feeds it.

pub mod lifecycle;
pub mod orchestrator;
pub mod sizing;
