//! Step and compensation definitions and the registry built from them.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use execution_store::CompensationKind;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::HandlerError;
use crate::handler::{CompensationHandler, HandlerGroup, StepHandler};
use crate::payload::{Payload, PayloadKind};
use crate::{Result, SagaError};

/// One saga step: consumes from an input queue and, unless terminal, publishes
/// its result to an output queue.
#[derive(Clone)]
pub struct StepDefinition {
    name: String,
    input_queue: String,
    output_queue: Option<String>,
    input_kind: PayloadKind,
    output_kind: PayloadKind,
    handler: Arc<dyn StepHandler>,
}

impl StepDefinition {
    /// Creates a terminal step with text input and output.
    pub fn new(
        name: impl Into<String>,
        input_queue: impl Into<String>,
        handler: impl StepHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            input_queue: input_queue.into(),
            output_queue: None,
            input_kind: PayloadKind::Text,
            output_kind: PayloadKind::Text,
            handler: Arc::new(handler),
        }
    }

    /// Creates a step that takes and returns JSON-encoded values.
    pub fn json<I, O, F, Fut>(
        name: impl Into<String>,
        input_queue: impl Into<String>,
        handler: F,
    ) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, HandlerError>> + Send + 'static,
    {
        let adapter = move |input: Payload| {
            let call = input.parse_json::<I>().map(&handler);
            async move {
                let output = call?.await?;
                Ok::<_, HandlerError>(Payload::from_json(&output)?)
            }
        };
        Self::new(name, input_queue, adapter)
            .with_input_kind(PayloadKind::Json)
            .with_output_kind(PayloadKind::Json)
    }

    /// Creates a step that takes the raw body and returns the display form of
    /// its result.
    pub fn text<O, F, Fut>(name: impl Into<String>, input_queue: impl Into<String>, handler: F) -> Self
    where
        O: Display + Send + 'static,
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, HandlerError>> + Send + 'static,
    {
        let adapter = move |input: Payload| {
            let call = handler(input.into_text());
            async move { Ok::<_, HandlerError>(Payload::Text(call.await?.to_string())) }
        };
        Self::new(name, input_queue, adapter)
    }

    pub fn with_output_queue(mut self, queue: impl Into<String>) -> Self {
        self.output_queue = Some(queue.into());
        self
    }

    pub fn with_input_kind(mut self, kind: PayloadKind) -> Self {
        self.input_kind = kind;
        self
    }

    pub fn with_output_kind(mut self, kind: PayloadKind) -> Self {
        self.output_kind = kind;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_queue(&self) -> &str {
        &self.input_queue
    }

    pub fn output_queue(&self) -> Option<&str> {
        self.output_queue.as_deref()
    }

    pub fn input_kind(&self) -> PayloadKind {
        self.input_kind
    }

    pub fn output_kind(&self) -> PayloadKind {
        self.output_kind
    }

    pub(crate) fn handler(&self) -> &dyn StepHandler {
        self.handler.as_ref()
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| SagaError::InvalidDefinition {
            step: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("step name is blank"));
        }
        if self.input_queue.trim().is_empty() {
            return Err(invalid("input queue is blank"));
        }
        if self.output_queue.as_deref().is_some_and(|q| q.trim().is_empty()) {
            return Err(invalid("output queue is blank"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("input_queue", &self.input_queue)
            .field("output_queue", &self.output_queue)
            .field("input_kind", &self.input_kind)
            .field("output_kind", &self.output_kind)
            .finish_non_exhaustive()
    }
}

/// A fallback or rollback attached to one step.
#[derive(Clone)]
pub struct CompensationDefinition {
    step_name: String,
    kind: CompensationKind,
    handler: Arc<dyn CompensationHandler>,
}

impl CompensationDefinition {
    pub fn new(
        step_name: impl Into<String>,
        kind: CompensationKind,
        handler: impl CompensationHandler + 'static,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            kind,
            handler: Arc::new(handler),
        }
    }

    pub fn fallback(step_name: impl Into<String>, handler: impl CompensationHandler + 'static) -> Self {
        Self::new(step_name, CompensationKind::Fallback, handler)
    }

    pub fn rollback(step_name: impl Into<String>, handler: impl CompensationHandler + 'static) -> Self {
        Self::new(step_name, CompensationKind::Rollback, handler)
    }

    /// Name of the step this compensates.
    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn kind(&self) -> CompensationKind {
        self.kind
    }

    pub(crate) fn handler(&self) -> &dyn CompensationHandler {
        self.handler.as_ref()
    }
}

impl std::fmt::Debug for CompensationDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompensationDefinition")
            .field("step_name", &self.step_name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Collects definitions before validating them into a [`StepRegistry`].
#[derive(Debug, Default)]
pub struct StepRegistryBuilder {
    steps: Vec<StepDefinition>,
    compensations: Vec<CompensationDefinition>,
}

impl StepRegistryBuilder {
    pub fn with_group(mut self, group: &dyn HandlerGroup) -> Self {
        let steps = group.steps();
        let compensations = group.compensations();
        debug!(
            group = group.name(),
            steps = steps.len(),
            compensations = compensations.len(),
            "Collected handler group"
        );
        self.steps.extend(steps);
        self.compensations.extend(compensations);
        self
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_compensation(mut self, compensation: CompensationDefinition) -> Self {
        self.compensations.push(compensation);
        self
    }

    /// Validates the collected definitions.
    ///
    /// Fails on duplicate step names, on a second fallback or rollback for the
    /// same step, and on compensations targeting an unknown step.
    pub fn build(self) -> Result<StepRegistry> {
        let mut steps = Vec::with_capacity(self.steps.len());
        let mut index = HashMap::new();
        for step in self.steps {
            step.validate()?;
            if index.contains_key(step.name()) {
                return Err(SagaError::DuplicateStep(step.name().to_string()));
            }
            index.insert(step.name().to_string(), steps.len());
            steps.push(Arc::new(step));
        }

        let mut fallbacks = HashMap::new();
        let mut rollbacks = HashMap::new();
        for compensation in self.compensations {
            let step = compensation.step_name().to_string();
            let kind = compensation.kind();
            if !index.contains_key(&step) {
                return Err(SagaError::UnknownCompensationTarget { step, kind });
            }
            let table = match kind {
                CompensationKind::Fallback => &mut fallbacks,
                CompensationKind::Rollback => &mut rollbacks,
            };
            if table.contains_key(&step) {
                return Err(SagaError::DuplicateCompensation { step, kind });
            }
            table.insert(step, Arc::new(compensation));
        }

        Ok(StepRegistry {
            steps,
            index,
            fallbacks,
            rollbacks,
        })
    }
}

/// Validated set of steps and their compensations.
#[derive(Debug)]
pub struct StepRegistry {
    steps: Vec<Arc<StepDefinition>>,
    index: HashMap<String, usize>,
    fallbacks: HashMap<String, Arc<CompensationDefinition>>,
    rollbacks: HashMap<String, Arc<CompensationDefinition>>,
}

impl StepRegistry {
    pub fn builder() -> StepRegistryBuilder {
        StepRegistryBuilder::default()
    }

    pub fn step(&self, name: &str) -> Option<&Arc<StepDefinition>> {
        self.index.get(name).map(|&i| &self.steps[i])
    }

    /// Steps in registration order.
    pub fn steps(&self) -> &[Arc<StepDefinition>] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn fallback(&self, step: &str) -> Option<&Arc<CompensationDefinition>> {
        self.fallbacks.get(step)
    }

    pub fn rollback(&self, step: &str) -> Option<&Arc<CompensationDefinition>> {
        self.rollbacks.get(step)
    }

    /// The compensation to run when `step` fails: its fallback if registered,
    /// else its rollback.
    pub fn compensation_for(&self, step: &str) -> Option<&Arc<CompensationDefinition>> {
        self.fallback(step).or_else(|| self.rollback(step))
    }

    /// Every input and output queue, deduplicated, in registration order.
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = Vec::new();
        for step in &self.steps {
            for queue in std::iter::once(step.input_queue()).chain(step.output_queue()) {
                if !queues.iter().any(|q| q == queue) {
                    queues.push(queue.to_string());
                }
            }
        }
        queues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::handler::FailedStep;

    async fn echo(input: Payload) -> std::result::Result<Payload, HandlerError> {
        Ok(input)
    }

    async fn noop(_: FailedStep) -> std::result::Result<(), HandlerError> {
        Ok(())
    }

    fn step(name: &str) -> StepDefinition {
        StepDefinition::new(name, format!("{name}.in"), echo)
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let err = StepRegistry::builder()
            .with_step(step("a"))
            .with_step(step("a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SagaError::DuplicateStep(ref name) if name == "a"));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_duplicate_compensation_rejected() {
        let err = StepRegistry::builder()
            .with_step(step("a"))
            .with_compensation(CompensationDefinition::rollback("a", noop))
            .with_compensation(CompensationDefinition::rollback("a", noop))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            SagaError::DuplicateCompensation {
                kind: CompensationKind::Rollback,
                ..
            }
        ));
    }

    #[test]
    fn test_compensation_for_unknown_step_rejected() {
        let err = StepRegistry::builder()
            .with_step(step("a"))
            .with_compensation(CompensationDefinition::fallback("b", noop))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            SagaError::UnknownCompensationTarget { ref step, .. } if step == "b"
        ));
    }

    #[test]
    fn test_blank_fields_rejected() {
        let err = StepRegistry::builder()
            .with_step(StepDefinition::new("a", " ", echo))
            .build()
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidDefinition { .. }));

        let err = StepRegistry::builder()
            .with_step(step("a").with_output_queue(""))
            .build()
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidDefinition { .. }));
    }

    #[test]
    fn test_fallback_preferred_over_rollback() {
        let registry = StepRegistry::builder()
            .with_step(step("a"))
            .with_step(step("b"))
            .with_compensation(CompensationDefinition::rollback("a", noop))
            .with_compensation(CompensationDefinition::fallback("a", noop))
            .with_compensation(CompensationDefinition::rollback("b", noop))
            .build()
            .unwrap();

        assert_eq!(
            registry.compensation_for("a").unwrap().kind(),
            CompensationKind::Fallback
        );
        assert_eq!(
            registry.compensation_for("b").unwrap().kind(),
            CompensationKind::Rollback
        );
        assert!(registry.compensation_for("c").is_none());
    }

    #[test]
    fn test_queues_in_registration_order() {
        let registry = StepRegistry::builder()
            .with_step(StepDefinition::new("a", "q1", echo).with_output_queue("q2"))
            .with_step(StepDefinition::new("b", "q2", echo).with_output_queue("q3"))
            .build()
            .unwrap();
        assert_eq!(registry.queues(), vec!["q1", "q2", "q3"]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.step("b").unwrap().input_queue(), "q2");
    }

    struct Group;

    impl HandlerGroup for Group {
        fn name(&self) -> &str {
            "group"
        }

        fn steps(&self) -> Vec<StepDefinition> {
            vec![step("x"), step("y")]
        }

        fn compensations(&self) -> Vec<CompensationDefinition> {
            vec![CompensationDefinition::fallback("y", noop)]
        }
    }

    #[test]
    fn test_group_contributes_definitions() {
        let registry = StepRegistry::builder().with_group(&Group).build().unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.fallback("y").is_some());
        assert!(registry.rollback("y").is_none());
    }
}
