//! Sample handler group: automobile proposal issuance.
//!
//! ```text
//! auto-proposal-issuance --issue_proposal--> issue-auto-proposal
//!     --create_order--> auto-proposal-transmitted --create_payment--> (end)
//! ```
//!
//! `issue_proposal` has a rollback and `create_order` has a fallback.

use saga::{
    CompensationDefinition, FailedStep, HandlerError, HandlerGroup, PayloadKind, StepDefinition,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const PROPOSAL_ISSUANCE_QUEUE: &str = "auto-proposal-issuance";
pub const ISSUE_PROPOSAL_QUEUE: &str = "issue-auto-proposal";
pub const PROPOSAL_TRANSMITTED_QUEUE: &str = "auto-proposal-transmitted";

/// Event that starts a proposal issuance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub event_type: String,
    pub event_id: String,
    pub resource_route: String,
    pub attempt_count: u32,
    pub event_timestamp: String,
}

/// Policy holder attached to an issued proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub name: String,
    pub email: String,
    pub phone: String,
}

pub struct ProposalSaga;

impl ProposalSaga {
    async fn issue_proposal(input: Notification) -> Result<Customer, HandlerError> {
        if input.event_id.trim().is_empty() {
            return Err("notification has no event id".into());
        }
        info!(
            event_type = %input.event_type,
            event_id = %input.event_id,
            attempt = input.attempt_count,
            "Issuing automobile proposal"
        );
        Ok(Customer {
            name: "João da Silva".to_string(),
            email: "joao.silva@example.com".to_string(),
            phone: "11999999999".to_string(),
        })
    }

    async fn create_order(customer: Customer) -> Result<String, HandlerError> {
        Ok(format!(
            "Order created for customer {}, email {}, phone {}->order_ok",
            customer.name, customer.email, customer.phone
        ))
    }

    async fn create_payment(order: String) -> Result<String, HandlerError> {
        Ok(format!("{order}->payment_ok"))
    }

    async fn rollback_proposal(failed: FailedStep) -> Result<(), HandlerError> {
        warn!(
            correlation_id = %failed.correlation_id,
            payload = %failed.payload,
            error = %failed.error,
            "Rolling back proposal"
        );
        Ok(())
    }

    async fn order_fallback(failed: FailedStep) -> Result<(), HandlerError> {
        warn!(
            correlation_id = %failed.correlation_id,
            payload = %failed.payload,
            error = %failed.error,
            "Order creation fell back"
        );
        Ok(())
    }
}

impl HandlerGroup for ProposalSaga {
    fn name(&self) -> &str {
        "proposal-saga"
    }

    fn steps(&self) -> Vec<StepDefinition> {
        vec![
            StepDefinition::json("issue_proposal", PROPOSAL_ISSUANCE_QUEUE, Self::issue_proposal)
                .with_output_queue(ISSUE_PROPOSAL_QUEUE),
            StepDefinition::json("create_order", ISSUE_PROPOSAL_QUEUE, Self::create_order)
                .with_output_kind(PayloadKind::Text)
                .with_output_queue(PROPOSAL_TRANSMITTED_QUEUE),
            StepDefinition::text("create_payment", PROPOSAL_TRANSMITTED_QUEUE, Self::create_payment),
        ]
    }

    fn compensations(&self) -> Vec<CompensationDefinition> {
        vec![
            CompensationDefinition::rollback("issue_proposal", Self::rollback_proposal),
            CompensationDefinition::fallback("create_order", Self::order_fallback),
        ]
    }
}
