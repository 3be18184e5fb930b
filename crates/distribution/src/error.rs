use thiserror::Error;

/// Errors raised by the distribution registries.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DistributionError {
    #[error("Shard {0} not found")]
    UnknownShard(String),

    #[error("Partition {0} not found")]
    UnknownPartition(String),
}

/// Result type for distribution operations.
pub type Result<T> = std::result::Result<T, DistributionError>;
