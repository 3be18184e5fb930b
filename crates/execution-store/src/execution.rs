use chrono::{DateTime, Utc};
use common::{CorrelationId, ExecutionId};
use serde::{Deserialize, Serialize};

/// Status of one processing attempt of a saga step.
///
/// Status transitions for a single inbound message:
/// ```text
/// IN_PROGRESS ──┬──► DONE
///               └──► FAILED ──┬──► IN_PROGRESS-FALLBACK ──► DONE | FAILED-FALLBACK
///                             ├──► IN_PROGRESS-ROLLBACK ──► DONE | FAILED-ROLLBACK
///                             └──► (absorbed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// The step handler is running.
    #[serde(rename = "IN_PROGRESS")]
    InProgress,

    /// The step or its compensation finished successfully (terminal state).
    #[serde(rename = "DONE")]
    Done,

    /// The step failed during decode, invoke or encode.
    #[serde(rename = "FAILED")]
    Failed,

    /// The fallback registered for the failed step is running.
    #[serde(rename = "IN_PROGRESS-FALLBACK")]
    InProgressFallback,

    /// The fallback itself failed (terminal state).
    #[serde(rename = "FAILED-FALLBACK")]
    FailedFallback,

    /// The rollback registered for the failed step is running.
    #[serde(rename = "IN_PROGRESS-ROLLBACK")]
    InProgressRollback,

    /// The rollback itself failed (terminal state).
    #[serde(rename = "FAILED-ROLLBACK")]
    FailedRollback,
}

impl ExecutionStatus {
    /// Returns true for every status except the `IN_PROGRESS*` family.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ExecutionStatus::InProgress
                | ExecutionStatus::InProgressFallback
                | ExecutionStatus::InProgressRollback
        )
    }

    /// Returns the persisted status label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::InProgress => "IN_PROGRESS",
            ExecutionStatus::Done => "DONE",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::InProgressFallback => "IN_PROGRESS-FALLBACK",
            ExecutionStatus::FailedFallback => "FAILED-FALLBACK",
            ExecutionStatus::InProgressRollback => "IN_PROGRESS-ROLLBACK",
            ExecutionStatus::FailedRollback => "FAILED-ROLLBACK",
        }
    }

    /// Parses a persisted status label.
    pub fn parse(label: &str) -> Option<Self> {
        let status = match label {
            "IN_PROGRESS" => ExecutionStatus::InProgress,
            "DONE" => ExecutionStatus::Done,
            "FAILED" => ExecutionStatus::Failed,
            "IN_PROGRESS-FALLBACK" => ExecutionStatus::InProgressFallback,
            "FAILED-FALLBACK" => ExecutionStatus::FailedFallback,
            "IN_PROGRESS-ROLLBACK" => ExecutionStatus::InProgressRollback,
            "FAILED-ROLLBACK" => ExecutionStatus::FailedRollback,
            _ => return None,
        };
        Some(status)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which compensating action a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompensationKind {
    Fallback,
    Rollback,
}

impl CompensationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompensationKind::Fallback => "fallback",
            CompensationKind::Rollback => "rollback",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "fallback" => Some(CompensationKind::Fallback),
            "rollback" => Some(CompensationKind::Rollback),
            _ => None,
        }
    }

    /// Status recorded when this compensation starts.
    pub fn in_progress_status(&self) -> ExecutionStatus {
        match self {
            CompensationKind::Fallback => ExecutionStatus::InProgressFallback,
            CompensationKind::Rollback => ExecutionStatus::InProgressRollback,
        }
    }

    /// Status recorded when this compensation fails.
    pub fn failed_status(&self) -> ExecutionStatus {
        match self {
            CompensationKind::Fallback => ExecutionStatus::FailedFallback,
            CompensationKind::Rollback => ExecutionStatus::FailedRollback,
        }
    }
}

impl std::fmt::Display for CompensationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One persisted processing attempt.
///
/// Records are never updated in place; each status transition produces a new
/// record with a fresh [`ExecutionId`] and the same correlation identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaExecution {
    /// Unique identifier of this record.
    pub id: ExecutionId,

    /// Correlation identifier shared by every record of one saga instance.
    pub correlation_id: CorrelationId,

    /// The step this attempt belongs to.
    pub step_name: String,

    /// Queue the message was consumed from.
    pub input_queue: String,

    /// Queue the result is published to; `None` for terminal steps.
    pub output_queue: Option<String>,

    /// Set on records written while a fallback or rollback runs.
    pub compensation: Option<CompensationKind>,

    /// Raw inbound message body.
    pub payload: String,

    /// Failure description; empty on success.
    pub message: String,

    pub status: ExecutionStatus,

    pub created_at: DateTime<Utc>,
}

impl SagaExecution {
    /// Creates a record with a fresh id, the current timestamp and an empty message.
    pub fn new(
        correlation_id: CorrelationId,
        step_name: impl Into<String>,
        input_queue: impl Into<String>,
        output_queue: Option<String>,
        payload: impl Into<String>,
        status: ExecutionStatus,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            correlation_id,
            step_name: step_name.into(),
            input_queue: input_queue.into(),
            output_queue,
            compensation: None,
            payload: payload.into(),
            message: String::new(),
            status,
            created_at: Utc::now(),
        }
    }

    /// Sets the failure description.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Marks the record as belonging to a compensation.
    pub fn with_compensation(mut self, kind: CompensationKind) -> Self {
        self.compensation = Some(kind);
        self
    }

    /// Returns true if the record carries a failure description.
    pub fn is_failure(&self) -> bool {
        !self.message.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!ExecutionStatus::InProgress.is_terminal());
        assert!(!ExecutionStatus::InProgressFallback.is_terminal());
        assert!(!ExecutionStatus::InProgressRollback.is_terminal());
        assert!(ExecutionStatus::Done.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::FailedFallback.is_terminal());
        assert!(ExecutionStatus::FailedRollback.is_terminal());
    }

    #[test]
    fn test_status_labels_round_trip_through_parse() {
        for status in [
            ExecutionStatus::InProgress,
            ExecutionStatus::Done,
            ExecutionStatus::Failed,
            ExecutionStatus::InProgressFallback,
            ExecutionStatus::FailedFallback,
            ExecutionStatus::InProgressRollback,
            ExecutionStatus::FailedRollback,
        ] {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ExecutionStatus::parse("RUNNING"), None);
    }

    #[test]
    fn test_status_serializes_with_persisted_label() {
        let json = serde_json::to_string(&ExecutionStatus::InProgressFallback).unwrap();
        assert_eq!(json, "\"IN_PROGRESS-FALLBACK\"");
    }

    #[test]
    fn test_compensation_statuses() {
        assert_eq!(
            CompensationKind::Fallback.in_progress_status(),
            ExecutionStatus::InProgressFallback
        );
        assert_eq!(
            CompensationKind::Rollback.failed_status(),
            ExecutionStatus::FailedRollback
        );
        assert_eq!(CompensationKind::parse("rollback"), Some(CompensationKind::Rollback));
    }

    #[test]
    fn test_new_record_defaults() {
        let correlation_id = CorrelationId::new();
        let record = SagaExecution::new(
            correlation_id.clone(),
            "issue_proposal",
            "proposal-issuance",
            Some("issue-proposal".to_string()),
            "{}",
            ExecutionStatus::InProgress,
        );

        assert_eq!(record.correlation_id, correlation_id);
        assert!(record.message.is_empty());
        assert!(record.compensation.is_none());
        assert!(!record.is_failure());

        let failed = record
            .clone()
            .with_message("boom")
            .with_compensation(CompensationKind::Fallback);
        assert!(failed.is_failure());
        assert_eq!(failed.compensation, Some(CompensationKind::Fallback));
    }
}
