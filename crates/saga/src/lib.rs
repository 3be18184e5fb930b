//! Saga orchestration over message queues.
//!
//! Business code contributes [`StepDefinition`]s and
//! [`CompensationDefinition`]s, usually grouped in a [`HandlerGroup`]. The
//! [`StepRegistry`] validates them, and the [`SagaEngine`] consumes each
//! step's input queue, runs its handler, records every status transition and
//! publishes results to the step's output queue with the correlation header.
//!
//! When a step fails, its fallback runs if one is registered, else its
//! rollback. A step with neither just records the failure.

pub mod engine;
pub mod error;
pub mod handler;
pub mod payload;
pub mod registry;

pub use engine::{DispatchOutcome, EngineGuards, EngineHandle, SagaEngine};
pub use error::{ErrorKind, HandlerError, Result, SagaError};
pub use handler::{CompensationHandler, FailedStep, HandlerGroup, StepHandler};
pub use payload::{Payload, PayloadKind};
pub use registry::{CompensationDefinition, StepDefinition, StepRegistry, StepRegistryBuilder};
