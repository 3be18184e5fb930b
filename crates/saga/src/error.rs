//! Saga error types.

use execution_store::{CompensationKind, ExecutionStoreError};
use messaging::BrokerError;
use thiserror::Error;

/// Error type returned by business handlers.
///
/// Boxed so handler code can use `?` on any error. A handler that returns a
/// [`SagaError`] keeps its [`ErrorKind`] when the engine classifies it.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Failure categories used for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Processing,
    Timeout,
    Network,
    Database,
    Messaging,
    CircuitBreakerOpen,
    RateLimitExceeded,
    Configuration,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Processing => "processing",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::Database => "database",
            ErrorKind::Messaging => "messaging",
            ErrorKind::CircuitBreakerOpen => "circuit_breaker_open",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::Configuration => "configuration",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while registering or running saga steps.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Two step definitions share a name.
    #[error("Step '{0}' is registered more than once")]
    DuplicateStep(String),

    /// Two fallbacks (or two rollbacks) target the same step.
    #[error("More than one {kind} is registered for step '{step}'")]
    DuplicateCompensation { step: String, kind: CompensationKind },

    /// A fallback or rollback targets a step that does not exist.
    #[error("{kind} targets unknown step '{step}'")]
    UnknownCompensationTarget { step: String, kind: CompensationKind },

    /// A step definition is missing a required field.
    #[error("Invalid definition for step '{step}': {reason}")]
    InvalidDefinition { step: String, reason: String },

    /// A message was dispatched to a step that is not registered.
    #[error("Unknown step: {0}")]
    UnknownStep(String),

    /// The inbound message does not match the step's declared input type.
    #[error("Failed to decode input for step '{step}': {reason}")]
    Decode { step: String, reason: String },

    /// The handler result could not be serialized.
    #[error("Failed to encode output of step '{step}': {reason}")]
    Encode { step: String, reason: String },

    /// The step handler failed.
    #[error("Step '{step}' failed: {source}")]
    Handler {
        step: String,
        #[source]
        source: HandlerError,
    },

    /// An operation did not finish in time.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The step's rate limit rejected the message.
    #[error("Rate limit exceeded for {key}")]
    RateLimitExceeded { key: String },

    /// The step's circuit breaker is open.
    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// A fallback or rollback failed.
    #[error("{kind} for step '{step}' failed: {reason}")]
    CompensationFailed {
        step: String,
        kind: CompensationKind,
        reason: String,
    },

    /// Broker error.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Execution store error.
    #[error("Execution store error: {0}")]
    Store(#[from] ExecutionStoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Classifies the error.
    ///
    /// Handler failures wrapping a `SagaError` report the inner kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SagaError::DuplicateStep(_)
            | SagaError::DuplicateCompensation { .. }
            | SagaError::UnknownCompensationTarget { .. }
            | SagaError::InvalidDefinition { .. }
            | SagaError::UnknownStep(_) => ErrorKind::Configuration,
            SagaError::Decode { .. } | SagaError::Serialization(_) => ErrorKind::Validation,
            SagaError::Encode { .. } | SagaError::CompensationFailed { .. } => {
                ErrorKind::Processing
            }
            SagaError::Handler { source, .. } => source
                .downcast_ref::<SagaError>()
                .map(SagaError::kind)
                .unwrap_or(ErrorKind::Processing),
            SagaError::Timeout(_) => ErrorKind::Timeout,
            SagaError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            SagaError::CircuitOpen { .. } => ErrorKind::CircuitBreakerOpen,
            SagaError::Broker(BrokerError::Connection(_)) => ErrorKind::Network,
            SagaError::Broker(_) => ErrorKind::Messaging,
            SagaError::Store(_) => ErrorKind::Database,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
