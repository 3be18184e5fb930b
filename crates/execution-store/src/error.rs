use thiserror::Error;

/// Errors that can occur when persisting execution records.
#[derive(Debug, Error)]
pub enum ExecutionStoreError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored value could not be mapped back onto a record.
    #[error("Invalid stored value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    /// The background recorder has stopped accepting records.
    #[error("Execution recorder is closed")]
    RecorderClosed,

    /// The recorder's queue is at capacity; the record was not accepted.
    #[error("Execution recorder queue is full")]
    RecorderFull,
}

/// Result type for execution store operations.
pub type Result<T> = std::result::Result<T, ExecutionStoreError>;
