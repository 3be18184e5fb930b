use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{CorrelationId, ExecutionId, ExecutionStatus, ExecutionStore, ExecutionStoreError, Result, SagaExecution};

#[derive(Default)]
struct Records {
    entries: Vec<SagaExecution>,
    positions: HashMap<ExecutionId, usize>,
}

impl Records {
    fn upsert(&mut self, execution: &SagaExecution) {
        match self.positions.get(&execution.id) {
            Some(&position) => self.entries[position] = execution.clone(),
            None => {
                self.positions.insert(execution.id, self.entries.len());
                self.entries.push(execution.clone());
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.positions.clear();
    }
}

/// In-memory execution store for tests and single-process deployments.
///
/// Records are kept in insertion order; saving a record whose id already
/// exists replaces it in place, like the PostgreSQL upsert.
#[derive(Clone, Default)]
pub struct InMemoryExecutionStore {
    records: Arc<RwLock<Records>>,
    fail_saves: Arc<AtomicBool>,
}

impl InMemoryExecutionStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `save` fail (for testing write-failure handling).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Returns every stored record in insertion order.
    pub async fn all(&self) -> Vec<SagaExecution> {
        self.records.read().await.entries.clone()
    }

    /// Returns the records of one saga instance in insertion order.
    pub async fn for_correlation(&self, correlation_id: &CorrelationId) -> Vec<SagaExecution> {
        self.records
            .read()
            .await
            .entries
            .iter()
            .filter(|r| &r.correlation_id == correlation_id)
            .cloned()
            .collect()
    }

    /// Returns the status sequence of one saga instance.
    pub async fn statuses_for(&self, correlation_id: &CorrelationId) -> Vec<ExecutionStatus> {
        self.for_correlation(correlation_id)
            .await
            .into_iter()
            .map(|r| r.status)
            .collect()
    }

    /// Returns the total number of stored records.
    pub async fn count(&self) -> usize {
        self.records.read().await.entries.len()
    }

    /// Clears all records.
    pub async fn clear(&self) {
        self.records.write().await.clear();
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn save(&self, execution: &SagaExecution) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(ExecutionStoreError::Database(sqlx::Error::PoolClosed));
        }

        self.records.write().await.upsert(execution);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(correlation_id: &CorrelationId, status: ExecutionStatus) -> SagaExecution {
        SagaExecution::new(
            correlation_id.clone(),
            "create_order",
            "issue-proposal",
            Some("create-order".to_string()),
            "{\"id\":1}",
            status,
        )
    }

    #[tokio::test]
    async fn test_save_appends_in_order() {
        let store = InMemoryExecutionStore::new();
        let correlation_id = CorrelationId::new();

        store
            .save(&record(&correlation_id, ExecutionStatus::InProgress))
            .await
            .unwrap();
        store
            .save(&record(&correlation_id, ExecutionStatus::Done))
            .await
            .unwrap();

        assert_eq!(store.count().await, 2);
        assert_eq!(
            store.statuses_for(&correlation_id).await,
            vec![ExecutionStatus::InProgress, ExecutionStatus::Done]
        );
    }

    #[tokio::test]
    async fn test_save_upserts_by_id() {
        let store = InMemoryExecutionStore::new();
        let correlation_id = CorrelationId::new();
        let mut execution = record(&correlation_id, ExecutionStatus::InProgress);

        store.save(&execution).await.unwrap();
        execution.message = "updated".to_string();
        store.save(&execution).await.unwrap();

        let all = store.all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].message, "updated");
    }

    #[tokio::test]
    async fn test_upsert_keeps_insertion_position() {
        let store = InMemoryExecutionStore::new();
        let correlation_id = CorrelationId::new();
        let mut first = record(&correlation_id, ExecutionStatus::InProgress);
        let second = record(&correlation_id, ExecutionStatus::Done);
        let third = record(&correlation_id, ExecutionStatus::Failed);

        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();
        store.save(&third).await.unwrap();

        first.message = "retried".to_string();
        store.save(&first).await.unwrap();
        store.save(&third).await.unwrap();

        let ids: Vec<_> = store.all().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first.id, second.id, third.id]);
        assert_eq!(store.for_correlation(&correlation_id).await[0].message, "retried");

        store.clear().await;
        store.save(&second).await.unwrap();
        assert_eq!(store.count().await, 1);
        assert_eq!(store.all().await[0].id, second.id);
    }

    #[tokio::test]
    async fn test_for_correlation_filters_other_instances() {
        let store = InMemoryExecutionStore::new();
        let first = CorrelationId::new();
        let second = CorrelationId::new();

        store
            .save(&record(&first, ExecutionStatus::InProgress))
            .await
            .unwrap();
        store
            .save(&record(&second, ExecutionStatus::InProgress))
            .await
            .unwrap();

        let records = store.for_correlation(&first).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].correlation_id, first);
    }

    #[tokio::test]
    async fn test_fail_saves_toggle() {
        let store = InMemoryExecutionStore::new();
        store.set_fail_saves(true);

        let result = store
            .save(&record(&CorrelationId::new(), ExecutionStatus::InProgress))
            .await;
        assert!(matches!(result, Err(ExecutionStoreError::Database(_))));
        assert_eq!(store.count().await, 0);

        store.set_fail_saves(false);
        store
            .save(&record(&CorrelationId::new(), ExecutionStatus::InProgress))
            .await
            .unwrap();
        assert_eq!(store.count().await, 1);
    }
}
