use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::{Delivery, OutboundMessage, Result, Topology};

/// A stream of deliveries from one queue.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

/// Message-queue capability used by the saga engine.
///
/// Deliveries are acknowledged on receipt: a consumer that fails to process a
/// message does not cause the broker to redeliver it.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Declares the exchange, queues and bindings. Idempotent.
    async fn declare_topology(&self, topology: &Topology) -> Result<()>;

    /// Publishes a message routed to `queue`.
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()>;

    /// Opens a consumer on `queue`.
    ///
    /// Several consumers on the same queue compete for its messages.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;
}
