use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgPoolOptions, postgres::PgRow};
use uuid::Uuid;

use crate::{
    CompensationKind, CorrelationId, ExecutionId, ExecutionStatus, ExecutionStore,
    ExecutionStoreError, Result, SagaExecution,
};

/// Connection-pool sizing for the PostgreSQL store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    pub min_connections: u32,
    pub max_connections: u32,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub acquire_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_connections: 5,
            max_connections: 100,
            idle_timeout: Duration::from_millis(60_000),
            max_lifetime: Duration::from_millis(300_000),
            acquire_timeout: Duration::from_millis(30_000),
        }
    }
}

/// PostgreSQL-backed execution store.
#[derive(Clone)]
pub struct PostgresExecutionStore {
    pool: PgPool,
}

impl PostgresExecutionStore {
    /// Creates a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a pool against `database_url` with the given sizing.
    pub async fn connect(database_url: &str, options: &PoolOptions) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(options.min_connections)
            .max_connections(options.max_connections)
            .idle_timeout(options.idle_timeout)
            .max_lifetime(options.max_lifetime)
            .acquire_timeout(options.acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Loads the records of one saga instance in insertion order.
    pub async fn find_by_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Vec<SagaExecution>> {
        let rows = sqlx::query(
            r#"
            SELECT id, correlation_id, step_name, input_queue, output_queue, compensation,
                   payload, message, status, created_at
            FROM saga_executions
            WHERE correlation_id = $1
            ORDER BY created_at ASC, seq ASC
            "#,
        )
        .bind(correlation_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_execution).collect()
    }

    fn row_to_execution(row: PgRow) -> Result<SagaExecution> {
        let correlation: String = row.try_get("correlation_id")?;
        let correlation_id = CorrelationId::parse(&correlation).ok_or_else(|| {
            ExecutionStoreError::InvalidValue {
                field: "correlation_id",
                value: correlation.clone(),
            }
        })?;

        let status_label: String = row.try_get("status")?;
        let status =
            ExecutionStatus::parse(&status_label).ok_or(ExecutionStoreError::InvalidValue {
                field: "status",
                value: status_label.clone(),
            })?;

        let compensation = match row.try_get::<Option<String>, _>("compensation")? {
            Some(label) => Some(CompensationKind::parse(&label).ok_or(
                ExecutionStoreError::InvalidValue {
                    field: "compensation",
                    value: label.clone(),
                },
            )?),
            None => None,
        };

        Ok(SagaExecution {
            id: ExecutionId::from_uuid(row.try_get::<Uuid, _>("id")?),
            correlation_id,
            step_name: row.try_get("step_name")?,
            input_queue: row.try_get("input_queue")?,
            output_queue: row.try_get("output_queue")?,
            compensation,
            payload: row.try_get("payload")?,
            message: row.try_get("message")?,
            status,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    #[tracing::instrument(skip(self, execution), fields(execution_id = %execution.id, status = %execution.status))]
    async fn save(&self, execution: &SagaExecution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_executions
                (id, correlation_id, step_name, input_queue, output_queue, compensation,
                 payload, message, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                correlation_id = EXCLUDED.correlation_id,
                step_name = EXCLUDED.step_name,
                input_queue = EXCLUDED.input_queue,
                output_queue = EXCLUDED.output_queue,
                compensation = EXCLUDED.compensation,
                payload = EXCLUDED.payload,
                message = EXCLUDED.message,
                status = EXCLUDED.status,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(execution.id.as_uuid())
        .bind(execution.correlation_id.as_str())
        .bind(&execution.step_name)
        .bind(&execution.input_queue)
        .bind(execution.output_queue.as_deref())
        .bind(execution.compensation.map(|c| c.as_str()))
        .bind(&execution.payload)
        .bind(&execution.message)
        .bind(execution.status.as_str())
        .bind(execution.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
