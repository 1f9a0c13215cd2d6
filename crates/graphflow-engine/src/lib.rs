//! The graph execution engine.
//!
//! [`GraphEngine`] validates submissions, persists their state, and feeds
//! the external scheduler one frontier at a time. Cycles are scheduled as
//! single units (see [`ExecutionPlan`]).

pub mod engine;
pub mod plan;
pub mod retry;
mod worker;

pub use engine::GraphEngine;
pub use plan::ExecutionPlan;
pub use retry::{calculate_backoff, with_retry};
