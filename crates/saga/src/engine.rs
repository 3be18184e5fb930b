//! Message-driven saga engine.
//!
//! One consume loop runs per registered step. Every delivery is dispatched on
//! its own task through the per-message state machine:
//!
//! ```text
//! IN_PROGRESS -> DONE                                   (success)
//! IN_PROGRESS -> FAILED -> IN_PROGRESS-FALLBACK -> DONE | FAILED-FALLBACK
//! IN_PROGRESS -> FAILED -> IN_PROGRESS-ROLLBACK -> DONE | FAILED-ROLLBACK
//! IN_PROGRESS -> FAILED                                 (no compensation)
//! ```
//!
//! Each transition is handed to the [`ExecutionRecorder`] without waiting for
//! the write. Deliveries are acknowledged on receipt, so a message whose
//! handler fails is never redelivered; the execution trail is its only record.

use std::sync::Arc;
use std::time::Instant;

use common::CorrelationId;
use execution_store::{CompensationKind, ExecutionRecorder, ExecutionStatus, SagaExecution};
use futures_util::StreamExt;
use messaging::{Delivery, DeliveryStream, MessageBroker, OutboundMessage, Topology};
use resilience::{CircuitBreakerError, CircuitBreakerManager, RateLimiter};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::error::HandlerError;
use crate::handler::FailedStep;
use crate::payload::Payload;
use crate::registry::{StepDefinition, StepRegistry};
use crate::{Result, SagaError};

/// What happened to one dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The step succeeded; `published` is false for terminal steps.
    Completed { published: bool },
    /// The step failed and its fallback or rollback succeeded.
    Compensated(CompensationKind),
    /// The step failed and no compensation is registered for it.
    Unhandled,
}

/// Admission control applied to every step invocation, keyed by step name.
///
/// A rejected admission or an open breaker counts as a step failure and is
/// routed through compensation like any other.
#[derive(Clone)]
pub struct EngineGuards {
    pub rate_limiter: Arc<RateLimiter>,
    pub circuit_breakers: Arc<CircuitBreakerManager>,
}

impl EngineGuards {
    pub fn new(rate_limiter: Arc<RateLimiter>, circuit_breakers: Arc<CircuitBreakerManager>) -> Self {
        Self {
            rate_limiter,
            circuit_breakers,
        }
    }
}

pub struct SagaEngine {
    registry: Arc<StepRegistry>,
    broker: Arc<dyn MessageBroker>,
    recorder: Arc<ExecutionRecorder>,
    guards: Option<EngineGuards>,
}

impl SagaEngine {
    pub fn new(
        registry: StepRegistry,
        broker: Arc<dyn MessageBroker>,
        recorder: Arc<ExecutionRecorder>,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            broker,
            recorder,
            guards: None,
        }
    }

    pub fn with_guards(mut self, guards: EngineGuards) -> Self {
        self.guards = Some(guards);
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Topology covering every queue the registered steps read or write.
    pub fn topology(&self, exchange: &str) -> Topology {
        Topology::new(exchange).with_queues(self.registry.queues())
    }

    /// Opens one consume loop per step and returns a handle to stop them.
    ///
    /// Declares nothing; the topology must exist before this is called.
    pub async fn start(self: Arc<Self>) -> Result<EngineHandle> {
        let (shutdown, signal) = watch::channel(false);
        let mut loops = Vec::with_capacity(self.registry.len());

        for step in self.registry.steps() {
            let deliveries = match self.broker.consume(step.input_queue()).await {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    let _ = shutdown.send(true);
                    return Err(e.into());
                }
            };
            info!(step = step.name(), queue = step.input_queue(), "Consuming step queue");
            let engine = Arc::clone(&self);
            loops.push(tokio::spawn(engine.consume_loop(
                step.name().to_string(),
                deliveries,
                signal.clone(),
            )));
        }

        Ok(EngineHandle { shutdown, loops })
    }

    #[tracing::instrument(skip_all, fields(step = %step_name))]
    async fn consume_loop(
        self: Arc<Self>,
        step_name: String,
        mut deliveries: DeliveryStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        let engine = Arc::clone(&self);
                        let step = step_name.clone();
                        in_flight.spawn(async move {
                            if let Err(e) = engine.dispatch(&step, delivery).await {
                                metrics::counter!("saga_errors_total", "kind" => e.kind().as_str())
                                    .increment(1);
                                error!(step = %step, kind = %e.kind(), error = %e, "Saga message failed");
                            }
                        });
                    }
                    Some(Err(e)) => warn!(error = %e, "Failed to receive delivery"),
                    None => {
                        warn!("Delivery stream ended");
                        break;
                    }
                },
            }
            while in_flight.try_join_next().is_some() {}
        }

        // Let dispatches already under way reach a terminal status.
        while in_flight.join_next().await.is_some() {}
        info!("Consume loop stopped");
    }

    /// Runs one message through `step_name`'s state machine.
    ///
    /// Step failures are recorded and routed to compensation; they are not
    /// returned. Errors come back only for an unknown step, a failed publish
    /// or a failed fallback/rollback.
    #[tracing::instrument(
        skip(self, delivery),
        fields(correlation_id = tracing::field::Empty)
    )]
    pub async fn dispatch(&self, step_name: &str, delivery: Delivery) -> Result<DispatchOutcome> {
        let step = self
            .registry
            .step(step_name)
            .cloned()
            .ok_or_else(|| SagaError::UnknownStep(step_name.to_string()))?;

        let correlation_id = delivery.correlation_id().unwrap_or_default();
        tracing::Span::current().record("correlation_id", tracing::field::display(&correlation_id));
        let payload = delivery.body_text();

        self.record(&step, &correlation_id, &payload, ExecutionStatus::InProgress, None);

        let started = Instant::now();
        let result = self.run_step(&step, &payload).await;
        metrics::histogram!("saga_step_duration_seconds", "step" => step.name().to_string())
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(output) => {
                self.record(&step, &correlation_id, &payload, ExecutionStatus::Done, None);
                count_dispatch(&step, ExecutionStatus::Done);

                let published = match step.output_queue() {
                    Some(queue) => {
                        let message = OutboundMessage::new(output).with_correlation_id(&correlation_id);
                        self.broker.publish(queue, message).await?;
                        true
                    }
                    None => false,
                };
                info!(published, "Step completed");
                Ok(DispatchOutcome::Completed { published })
            }
            Err(e) => {
                let kind = e.kind();
                warn!(kind = %kind, error = %e, "Step failed");
                self.recorder.record_async(
                    execution(&step, &correlation_id, &payload, ExecutionStatus::Failed)
                        .with_message(e.to_string()),
                );
                count_dispatch(&step, ExecutionStatus::Failed);
                metrics::counter!("saga_errors_total", "kind" => kind.as_str()).increment(1);

                self.compensate(&step, &correlation_id, &payload, e).await
            }
        }
    }

    async fn run_step(&self, step: &StepDefinition, raw: &str) -> Result<String> {
        let input = Payload::decode(step.name(), raw, step.input_kind())?;
        let output = self.invoke(step, input).await?;
        output.encode(step.name(), step.output_kind())
    }

    async fn invoke(&self, step: &StepDefinition, input: Payload) -> Result<Payload> {
        let handler_failed = |source: HandlerError| SagaError::Handler {
            step: step.name().to_string(),
            source,
        };

        let Some(guards) = &self.guards else {
            return step.handler().handle(input).await.map_err(handler_failed);
        };

        if !guards.rate_limiter.try_acquire(step.name()) {
            return Err(SagaError::RateLimitExceeded {
                key: step.name().to_string(),
            });
        }
        guards
            .circuit_breakers
            .execute(step.name(), || step.handler().handle(input))
            .await
            .map_err(|e| match e {
                CircuitBreakerError::CircuitOpen { name } => SagaError::CircuitOpen { name },
                CircuitBreakerError::OperationFailed(source) => handler_failed(source),
            })
    }

    /// Runs the step's fallback, else its rollback, else gives up.
    async fn compensate(
        &self,
        step: &StepDefinition,
        correlation_id: &CorrelationId,
        payload: &str,
        failure: SagaError,
    ) -> Result<DispatchOutcome> {
        let Some(compensation) = self.registry.compensation_for(step.name()).cloned() else {
            warn!(error = %failure, "No fallback or rollback registered; dropping message");
            return Ok(DispatchOutcome::Unhandled);
        };
        let kind = compensation.kind();

        let error = failure.to_string();
        self.recorder.record_async(
            execution(step, correlation_id, payload, kind.in_progress_status())
                .with_compensation(kind)
                .with_message(error.clone()),
        );
        let failed = FailedStep {
            correlation_id: correlation_id.clone(),
            step_name: step.name().to_string(),
            payload: payload.to_string(),
            error,
        };

        match compensation.handler().compensate(failed).await {
            Ok(()) => {
                self.record(step, correlation_id, payload, ExecutionStatus::Done, Some(kind));
                count_compensation(step, kind, "done");
                info!(compensation = %kind, "Compensation completed");
                Ok(DispatchOutcome::Compensated(kind))
            }
            Err(source) => {
                let reason = source.to_string();
                self.recorder.record_async(
                    execution(step, correlation_id, payload, kind.failed_status())
                        .with_compensation(kind)
                        .with_message(reason.clone()),
                );
                count_compensation(step, kind, "failed");
                Err(SagaError::CompensationFailed {
                    step: step.name().to_string(),
                    kind,
                    reason,
                })
            }
        }
    }

    fn record(
        &self,
        step: &StepDefinition,
        correlation_id: &CorrelationId,
        payload: &str,
        status: ExecutionStatus,
        compensation: Option<CompensationKind>,
    ) {
        let mut record = execution(step, correlation_id, payload, status);
        record.compensation = compensation;
        self.recorder.record_async(record);
    }
}

fn execution(
    step: &StepDefinition,
    correlation_id: &CorrelationId,
    payload: &str,
    status: ExecutionStatus,
) -> SagaExecution {
    SagaExecution::new(
        correlation_id.clone(),
        step.name(),
        step.input_queue(),
        step.output_queue().map(str::to_string),
        payload,
        status,
    )
}

fn count_dispatch(step: &StepDefinition, status: ExecutionStatus) {
    metrics::counter!(
        "saga_step_dispatch_total",
        "step" => step.name().to_string(),
        "status" => status.as_str()
    )
    .increment(1);
}

fn count_compensation(step: &StepDefinition, kind: CompensationKind, outcome: &'static str) {
    metrics::counter!(
        "saga_compensations_total",
        "step" => step.name().to_string(),
        "kind" => kind.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Stops the consume loops started by [`SagaEngine::start`].
///
/// Dropping the handle stops the loops as well.
pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn step_count(&self) -> usize {
        self.loops.len()
    }

    /// Signals every loop to stop and waits for in-flight dispatches to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for consume_loop in self.loops {
            if let Err(e) = consume_loop.await {
                error!(error = %e, "Consume loop panicked");
            }
        }
    }
}
