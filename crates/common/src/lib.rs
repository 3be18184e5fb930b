//! Identifier types shared across the saga orchestration crates.

mod types;

pub use types::{CorrelationId, ExecutionId};
