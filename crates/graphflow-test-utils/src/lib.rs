//! Shared test utilities, mocks, and fixtures for graphflow crates.

pub mod fixtures;
pub mod scheduler;
pub mod store;

pub use fixtures::{description_from_edges, request_from_edges, scenario_a_edges};
pub use scheduler::{MockScheduler, StopCall};
pub use store::FlakyStore;
