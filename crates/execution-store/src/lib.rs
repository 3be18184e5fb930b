//! Persistence of saga execution records.
//!
//! Every status transition of every processed message is written as a new
//! [`SagaExecution`] record, giving an append-only audit trail keyed by
//! correlation identifier. The engine never writes records inline: it hands
//! them to an [`ExecutionRecorder`], which persists them in the background.

pub mod error;
pub mod execution;
pub mod memory;
pub mod postgres;
pub mod recorder;
pub mod store;

pub use common::{CorrelationId, ExecutionId};
pub use error::{ExecutionStoreError, Result};
pub use execution::{CompensationKind, ExecutionStatus, SagaExecution};
pub use memory::InMemoryExecutionStore;
pub use postgres::{PoolOptions, PostgresExecutionStore};
pub use recorder::{ExecutionRecorder, RecorderConfig};
pub use store::ExecutionStore;
