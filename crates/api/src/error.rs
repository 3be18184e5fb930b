//! Error types for the admin API and process startup.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use execution_store::ExecutionStoreError;
use messaging::BrokerError;
use saga::SagaError;
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

/// Failures that stop the orchestrator from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Failed to install metrics recorder: {0}")]
    Metrics(String),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Execution store error: {0}")]
    Store(#[from] ExecutionStoreError),

    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
