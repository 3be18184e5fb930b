use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{CorrelationId, ExecutionStore, ExecutionStoreError, Result, SagaExecution};

enum Command {
    Record(Box<SagaExecution>),
    Flush(oneshot::Sender<()>),
}

/// Sizing of the background writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecorderConfig {
    /// Records each writer may have queued before new ones are dropped.
    pub capacity: usize,
    /// Number of concurrent writer tasks.
    pub writers: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            writers: 4,
        }
    }
}

/// Best-effort background writer for execution records.
///
/// Records submitted through [`record_async`](Self::record_async) are routed
/// to one of several writer tasks by correlation identifier, so the records of
/// one saga instance are written in submission order. Each writer reads from
/// a bounded queue; a record arriving at a full queue is dropped and counted.
/// Write failures are logged and counted; they are never retried and never
/// reported to the submitter.
pub struct ExecutionRecorder {
    senders: Vec<mpsc::Sender<Command>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutionRecorder {
    /// Spawns the background writers with the default sizing.
    pub fn spawn(store: Arc<dyn ExecutionStore>) -> Self {
        Self::spawn_with(store, RecorderConfig::default())
    }

    pub fn spawn_with(store: Arc<dyn ExecutionStore>, config: RecorderConfig) -> Self {
        let writers = config.writers.max(1);
        let mut senders = Vec::with_capacity(writers);
        let mut workers = Vec::with_capacity(writers);
        for _ in 0..writers {
            let (sender, receiver) = mpsc::channel(config.capacity.max(1));
            senders.push(sender);
            workers.push(tokio::spawn(run_worker(Arc::clone(&store), receiver)));
        }
        Self {
            senders,
            workers: Mutex::new(workers),
        }
    }

    /// Submits a record without waiting for it to be written.
    pub fn record_async(&self, execution: SagaExecution) {
        if let Err(e) = self.try_record(execution) {
            if matches!(e, ExecutionStoreError::RecorderFull) {
                metrics::counter!("saga_execution_records_dropped_total").increment(1);
            }
            metrics::counter!("saga_execution_record_failures_total").increment(1);
            warn!(error = %e, "Dropping execution record");
        }
    }

    /// Submits a record, failing if the recorder has shut down or the
    /// writer's queue is full.
    pub fn try_record(&self, execution: SagaExecution) -> Result<()> {
        let sender = self.sender_for(&execution.correlation_id);
        sender
            .try_send(Command::Record(Box::new(execution)))
            .map_err(|e| match e {
                TrySendError::Full(_) => ExecutionStoreError::RecorderFull,
                TrySendError::Closed(_) => ExecutionStoreError::RecorderClosed,
            })
    }

    /// Waits until every record submitted before this call has been written
    /// (or has failed).
    pub async fn flush(&self) -> Result<()> {
        let pending = self.senders.iter().map(|sender| async move {
            let (tx, rx) = oneshot::channel();
            sender
                .send(Command::Flush(tx))
                .await
                .map_err(|_| ExecutionStoreError::RecorderClosed)?;
            rx.await.map_err(|_| ExecutionStoreError::RecorderClosed)
        });
        join_all(pending).await.into_iter().collect()
    }

    /// Drains outstanding records and stops the writers.
    ///
    /// Records submitted after shutdown are dropped.
    pub async fn shutdown(&self) {
        let _ = self.flush().await;
        for worker in self.workers.lock().await.drain(..) {
            worker.abort();
            let _ = worker.await;
        }
    }

    fn sender_for(&self, correlation_id: &CorrelationId) -> &mpsc::Sender<Command> {
        let mut hasher = DefaultHasher::new();
        correlation_id.hash(&mut hasher);
        let index = (hasher.finish() % self.senders.len() as u64) as usize;
        &self.senders[index]
    }
}

async fn run_worker(store: Arc<dyn ExecutionStore>, mut receiver: mpsc::Receiver<Command>) {
    while let Some(command) = receiver.recv().await {
        match command {
            Command::Record(execution) => {
                if let Err(e) = store.save(&execution).await {
                    metrics::counter!("saga_execution_record_failures_total").increment(1);
                    warn!(
                        execution_id = %execution.id,
                        correlation_id = %execution.correlation_id,
                        step = %execution.step_name,
                        status = %execution.status,
                        error = %e,
                        "Failed to persist execution record"
                    );
                } else {
                    debug!(
                        execution_id = %execution.id,
                        status = %execution.status,
                        "Execution record persisted"
                    );
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
