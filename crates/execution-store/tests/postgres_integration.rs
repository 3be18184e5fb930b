//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container.
//! Run with:
//!
//! ```bash
//! cargo test -p execution-store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use execution_store::{
    CompensationKind, CorrelationId, ExecutionRecorder, ExecutionStatus, ExecutionStore,
    PostgresExecutionStore, SagaExecution,
};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_saga_executions.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and a cleared table
async fn get_test_store() -> PostgresExecutionStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_executions")
        .execute(&pool)
        .await
        .unwrap();

    PostgresExecutionStore::new(pool)
}

fn record(correlation_id: &CorrelationId, status: ExecutionStatus) -> SagaExecution {
    SagaExecution::new(
        correlation_id.clone(),
        "issue_proposal",
        "proposal-issuance",
        Some("issue-proposal".to_string()),
        r#"{"proposal":"P-1"}"#,
        status,
    )
}

#[tokio::test]
async fn test_save_and_load_by_correlation() {
    let store = get_test_store().await;
    let correlation_id = CorrelationId::new();

    let started = record(&correlation_id, ExecutionStatus::InProgress);
    store.save(&started).await.unwrap();

    let loaded = store.find_by_correlation(&correlation_id).await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id, started.id);
    assert_eq!(loaded[0].status, ExecutionStatus::InProgress);
    assert_eq!(loaded[0].output_queue.as_deref(), Some("issue-proposal"));
    assert!(loaded[0].compensation.is_none());
}

#[tokio::test]
async fn test_save_upserts_existing_id() {
    let store = get_test_store().await;
    let correlation_id = CorrelationId::new();

    let mut execution = record(&correlation_id, ExecutionStatus::InProgress);
    store.save(&execution).await.unwrap();

    execution.status = ExecutionStatus::Failed;
    execution.message = "handler failed".to_string();
    store.save(&execution).await.unwrap();

    let loaded = store.find_by_correlation(&correlation_id).await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].status, ExecutionStatus::Failed);
    assert_eq!(loaded[0].message, "handler failed");
}

#[tokio::test]
async fn test_compensation_and_terminal_step_round_trip() {
    let store = get_test_store().await;
    let correlation_id = CorrelationId::new();

    let mut execution = record(&correlation_id, ExecutionStatus::FailedRollback)
        .with_compensation(CompensationKind::Rollback)
        .with_message("rollback failed");
    execution.output_queue = None;
    store.save(&execution).await.unwrap();

    let loaded = store.find_by_correlation(&correlation_id).await.unwrap();
    assert_eq!(loaded[0].compensation, Some(CompensationKind::Rollback));
    assert_eq!(loaded[0].status, ExecutionStatus::FailedRollback);
    assert!(loaded[0].output_queue.is_none());
}

#[tokio::test]
async fn test_recorder_writes_trail_in_order() {
    let store = get_test_store().await;
    let recorder = ExecutionRecorder::spawn(Arc::new(store.clone()));
    let correlation_id = CorrelationId::new();

    for status in [
        ExecutionStatus::InProgress,
        ExecutionStatus::Failed,
        ExecutionStatus::InProgressFallback,
        ExecutionStatus::Done,
    ] {
        recorder.record_async(record(&correlation_id, status));
    }
    recorder.shutdown().await;

    let statuses: Vec<_> = store
        .find_by_correlation(&correlation_id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            ExecutionStatus::InProgress,
            ExecutionStatus::Failed,
            ExecutionStatus::InProgressFallback,
            ExecutionStatus::Done,
        ]
    );
}
