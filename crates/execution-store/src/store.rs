use async_trait::async_trait;

use crate::{Result, SagaExecution};

/// Persistence capability required by the saga engine.
///
/// The engine only ever writes: each call upserts one record by its id.
/// No read path is part of the contract; implementations may offer one.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Inserts the record, replacing any existing record with the same id.
    async fn save(&self, execution: &SagaExecution) -> Result<()>;
}

#[async_trait]
impl<T: ExecutionStore + ?Sized> ExecutionStore for std::sync::Arc<T> {
    async fn save(&self, execution: &SagaExecution) -> Result<()> {
        (**self).save(execution).await
    }
}
