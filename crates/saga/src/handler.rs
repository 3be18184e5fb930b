//! Handler traits implemented by business code.

use std::future::Future;

use async_trait::async_trait;
use common::CorrelationId;

use crate::error::HandlerError;
use crate::payload::Payload;
use crate::registry::{CompensationDefinition, StepDefinition};

/// The operation behind one saga step.
///
/// Implemented for any `Fn(Payload) -> impl Future<Output = Result<Payload, HandlerError>>`.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(&self, input: Payload) -> Result<Payload, HandlerError>;
}

#[async_trait]
impl<F, Fut> StepHandler for F
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, HandlerError>> + Send,
{
    async fn handle(&self, input: Payload) -> Result<Payload, HandlerError> {
        (self)(input).await
    }
}

/// The message a fallback or rollback receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedStep {
    pub correlation_id: CorrelationId,
    pub step_name: String,
    /// Raw body of the message the step failed on.
    pub payload: String,
    /// Description of the step failure.
    pub error: String,
}

/// A fallback or rollback operation.
#[async_trait]
pub trait CompensationHandler: Send + Sync {
    async fn compensate(&self, failed: FailedStep) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> CompensationHandler for F
where
    F: Fn(FailedStep) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn compensate(&self, failed: FailedStep) -> Result<(), HandlerError> {
        (self)(failed).await
    }
}

/// A set of related steps and compensations contributed by one business module.
pub trait HandlerGroup: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    fn steps(&self) -> Vec<StepDefinition>;

    fn compensations(&self) -> Vec<CompensationDefinition> {
        Vec::new()
    }
}
