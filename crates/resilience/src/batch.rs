//! Chunked, bounded-concurrency batch processing.
//!
//! Items are split into fixed-size chunks; a bounded number of chunks run at
//! once, and within each chunk a bounded number of items run at once. Every
//! item attempt is bounded by a timeout. An item that times out or keeps
//! failing is dropped from the results; the batch as a whole never fails.
//! Result order is not preserved.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use execution_store::SagaExecution;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Batch sizing, concurrency and failure policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub chunk_size: usize,
    pub chunk_concurrency: usize,
    pub item_concurrency: usize,
    /// Deadline for a single attempt of a single item.
    pub item_timeout: Duration,
    /// Extra attempts after the first failure; 0 disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each further retry.
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// When set, chunks pass through a bounded buffer of this many chunks.
    pub buffer_capacity: Option<usize>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            chunk_concurrency: 5,
            item_concurrency: 10,
            item_timeout: Duration::from_secs(30),
            max_retries: 0,
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(30),
            buffer_capacity: None,
        }
    }
}

impl BatchConfig {
    /// Default sizing with bounded exponential-backoff retries per item.
    pub fn with_retry(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
            ..Self::default()
        }
    }

    /// Bounded buffer of 1000 chunks drained by 3 concurrent chunk workers.
    pub fn with_backpressure() -> Self {
        Self {
            chunk_concurrency: 3,
            buffer_capacity: Some(1000),
            ..Self::default()
        }
    }

    /// Sizing used for batches of execution records.
    pub fn saga_batch() -> Self {
        Self {
            chunk_size: 50,
            item_timeout: Duration::from_secs(60),
            ..Self::default()
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.retry_delay
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }
}

/// Counts and timing of one batch run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatchStats {
    pub total_items: usize,
    pub processed_items: usize,
    pub failed_items: usize,
    pub processing_time: Duration,
}

impl BatchStats {
    /// Fraction of items that produced a result, or 0.0 for an empty batch.
    pub fn success_rate(&self) -> f64 {
        if self.total_items == 0 {
            0.0
        } else {
            self.processed_items as f64 / self.total_items as f64
        }
    }
}

/// Results of one batch run, in completion order.
#[derive(Debug, Clone)]
pub struct BatchReport<R> {
    pub results: Vec<R>,
    pub stats: BatchStats,
}

#[derive(Debug, Clone, Default)]
pub struct BatchProcessor {
    config: BatchConfig,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Processes `items` with `operation` and returns the successful results.
    pub async fn process<T, R, E, F, Fut>(&self, items: Vec<T>, operation: F) -> Vec<R>
    where
        T: Clone + Send,
        R: Send,
        E: Display,
        F: Fn(T) -> Fut + Sync,
        Fut: Future<Output = Result<R, E>> + Send,
    {
        self.run(items, operation).await.results
    }

    /// Processes `items` with `operation`, returning results and statistics.
    pub async fn run<T, R, E, F, Fut>(&self, items: Vec<T>, operation: F) -> BatchReport<R>
    where
        T: Clone + Send,
        R: Send,
        E: Display,
        F: Fn(T) -> Fut + Sync,
        Fut: Future<Output = Result<R, E>> + Send,
    {
        let started = Instant::now();
        let total_items = items.len();
        let chunks = into_chunks(items, self.config.chunk_size.max(1));
        let chunk_concurrency = self.config.chunk_concurrency.max(1);
        let operation = &operation;

        let chunk_results: Vec<Vec<R>> = match self.config.buffer_capacity {
            Some(capacity) => {
                let (tx, mut rx) = mpsc::channel::<Vec<T>>(capacity.max(1));
                let producer = async move {
                    for chunk in chunks {
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                };
                let consumer = stream::poll_fn(|cx| rx.poll_recv(cx))
                    .map(|chunk| self.process_chunk(chunk, operation))
                    .buffer_unordered(chunk_concurrency)
                    .collect::<Vec<_>>();
                let ((), results) = tokio::join!(producer, consumer);
                results
            }
            None => {
                stream::iter(chunks)
                    .map(|chunk| self.process_chunk(chunk, operation))
                    .buffer_unordered(chunk_concurrency)
                    .collect()
                    .await
            }
        };

        let results: Vec<R> = chunk_results.into_iter().flatten().collect();
        let stats = BatchStats {
            total_items,
            processed_items: results.len(),
            failed_items: total_items - results.len(),
            processing_time: started.elapsed(),
        };

        metrics::counter!("batch_items_processed_total").increment(stats.processed_items as u64);
        metrics::counter!("batch_items_failed_total").increment(stats.failed_items as u64);
        metrics::histogram!("batch_duration_seconds").record(stats.processing_time.as_secs_f64());
        debug!(
            total = stats.total_items,
            processed = stats.processed_items,
            failed = stats.failed_items,
            "Batch finished"
        );

        BatchReport { results, stats }
    }

    async fn process_chunk<T, R, E, F, Fut>(&self, chunk: Vec<T>, operation: &F) -> Vec<R>
    where
        T: Clone,
        E: Display,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        stream::iter(chunk)
            .map(|item| self.process_item(item, operation))
            .buffer_unordered(self.config.item_concurrency.max(1))
            .filter_map(|result| async move { result })
            .collect()
            .await
    }

    async fn process_item<T, R, E, F, Fut>(&self, item: T, operation: &F) -> Option<R>
    where
        T: Clone,
        E: Display,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let mut retry = 0;
        loop {
            match tokio::time::timeout(self.config.item_timeout, operation(item.clone())).await {
                Ok(Ok(result)) => return Some(result),
                Ok(Err(e)) => warn!(error = %e, attempt = retry + 1, "Batch item failed"),
                Err(_) => warn!(
                    timeout_ms = self.config.item_timeout.as_millis() as u64,
                    attempt = retry + 1,
                    "Batch item timed out"
                ),
            }

            if retry >= self.config.max_retries {
                return None;
            }
            tokio::time::sleep(self.config.backoff(retry)).await;
            retry += 1;
        }
    }
}

/// Runs a batch of execution records with the [`BatchConfig::saga_batch`] sizing.
pub async fn process_saga_batch<E, F, Fut>(
    executions: Vec<SagaExecution>,
    operation: F,
) -> BatchReport<SagaExecution>
where
    E: Display,
    F: Fn(SagaExecution) -> Fut + Sync,
    Fut: Future<Output = Result<SagaExecution, E>> + Send,
{
    BatchProcessor::new(BatchConfig::saga_batch())
        .run(executions, operation)
        .await
}

fn into_chunks<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size);
    for item in items {
        current.push(item);
        if current.len() == size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use execution_store::{CorrelationId, ExecutionStatus};

    #[test]
    fn test_into_chunks() {
        let chunks = into_chunks((0..7).collect(), 3);
        assert_eq!(chunks, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
        assert!(into_chunks(Vec::<u8>::new(), 3).is_empty());
    }

    #[test]
    fn test_presets() {
        let default = BatchConfig::default();
        assert_eq!(default.chunk_size, 100);
        assert_eq!(default.chunk_concurrency, 5);
        assert_eq!(default.item_concurrency, 10);
        assert_eq!(default.item_timeout, Duration::from_secs(30));

        let backpressure = BatchConfig::with_backpressure();
        assert_eq!(backpressure.chunk_concurrency, 3);
        assert_eq!(backpressure.buffer_capacity, Some(1000));

        let saga = BatchConfig::saga_batch();
        assert_eq!(saga.chunk_size, 50);
        assert_eq!(saga.item_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = BatchConfig {
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_millis(500),
            ..BatchConfig::default()
        };
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(2), Duration::from_millis(400));
        assert_eq!(config.backoff(3), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_all_items_processed() {
        let processor = BatchProcessor::new(BatchConfig {
            chunk_size: 4,
            ..BatchConfig::default()
        });

        let report = processor
            .run((1..=10).collect(), |n: u32| async move { Ok::<_, String>(n * 2) })
            .await;

        let mut results = report.results;
        results.sort();
        assert_eq!(results, (1..=10).map(|n| n * 2).collect::<Vec<_>>());
        assert_eq!(report.stats.total_items, 10);
        assert_eq!(report.stats.failed_items, 0);
        assert_eq!(report.stats.success_rate(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_items_are_dropped() {
        let processor = BatchProcessor::new(BatchConfig {
            chunk_size: 3,
            item_timeout: Duration::from_secs(1),
            ..BatchConfig::default()
        });

        let report = processor
            .run((0..10).collect(), |n: u32| async move {
                if n % 3 == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok::<_, String>(n)
            })
            .await;

        // 0, 3, 6 and 9 time out.
        assert_eq!(report.results.len(), 6);
        assert_eq!(report.stats.failed_items, 4);
        assert!(!report.results.iter().any(|n| n % 3 == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_items_are_retried_then_dropped() {
        let processor = BatchProcessor::new(BatchConfig::with_retry(3, Duration::from_millis(10)));
        let attempts = Arc::new(AtomicUsize::new(0));

        let report = processor
            .run(vec!["bad"], |_item: &str| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("always fails")
                }
            })
            .await;

        assert!(report.results.is_empty());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(report.stats.success_rate(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_flaky_item() {
        let processor = BatchProcessor::new(BatchConfig::with_retry(3, Duration::from_millis(10)));
        let attempts = Arc::new(AtomicUsize::new(0));

        let results = processor
            .process(vec![7u32], |n| {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("not yet")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(results, vec![7]);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backpressure_variant_processes_everything() {
        let processor = BatchProcessor::new(BatchConfig {
            chunk_size: 10,
            buffer_capacity: Some(2),
            ..BatchConfig::with_backpressure()
        });

        let report = processor
            .run((0..250).collect(), |n: u64| async move {
                if n == 42 { Err("bad item") } else { Ok(n) }
            })
            .await;

        assert_eq!(report.results.len(), 249);
        assert_eq!(report.stats.failed_items, 1);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let report = BatchProcessor::default()
            .run(Vec::<u8>::new(), |n| async move { Ok::<_, String>(n) })
            .await;
        assert!(report.results.is_empty());
        assert_eq!(report.stats.success_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_process_saga_batch() {
        let executions: Vec<SagaExecution> = (0..5)
            .map(|i| {
                SagaExecution::new(
                    CorrelationId::new(),
                    "create_order",
                    "issue-proposal",
                    None,
                    format!("{i}"),
                    ExecutionStatus::InProgress,
                )
            })
            .collect();

        let report = process_saga_batch(executions, |mut execution| async move {
            execution.status = ExecutionStatus::Done;
            Ok::<_, String>(execution)
        })
        .await;

        assert_eq!(report.results.len(), 5);
        assert!(report.results.iter().all(|e| e.status == ExecutionStatus::Done));
    }
}
