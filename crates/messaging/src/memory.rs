use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use crate::{
    BrokerError, Delivery, DeliveryStream, MessageBroker, OutboundMessage, Result, Topology,
};

struct QueueChannel {
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<Delivery>>>,
    published: Mutex<Vec<Delivery>>,
}

impl QueueChannel {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
            published: Mutex::new(Vec::new()),
        }
    }
}

/// In-process broker for tests and single-process deployments.
///
/// Each queue is a FIFO channel; consumers of the same queue compete for
/// messages. Queues are created on first use, so publishing to a queue that
/// was never declared still reaches later consumers.
///
/// Brokers built with [`InMemoryBroker::with_publish_log`] also keep every
/// published message in a per-queue log for inspection. The log is never
/// pruned, so the default broker does not keep one.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    queues: Arc<DashMap<String, Arc<QueueChannel>>>,
    declared: Arc<DashSet<String>>,
    fail_publish: Arc<AtomicBool>,
    publish_log: bool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker that records every published message (for testing).
    pub fn with_publish_log() -> Self {
        Self {
            publish_log: true,
            ..Self::default()
        }
    }

    fn queue(&self, name: &str) -> Arc<QueueChannel> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueChannel::new()))
            .clone()
    }

    /// Makes every subsequent `publish` fail (for testing).
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Returns true if the queue was declared through a topology.
    pub fn is_declared(&self, queue: &str) -> bool {
        self.declared.contains(queue)
    }

    /// Returns every message published to `queue`, consumed or not.
    ///
    /// Always empty unless the broker was built with a publish log.
    pub fn published(&self, queue: &str) -> Vec<Delivery> {
        self.queues
            .get(queue)
            .map(|q| q.published.lock().clone())
            .unwrap_or_default()
    }

    /// Returns the number of messages published to `queue`.
    pub fn published_count(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .map(|q| q.published.lock().len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn declare_topology(&self, topology: &Topology) -> Result<()> {
        for queue in &topology.queues {
            self.queue(queue);
            self.declared.insert(queue.clone());
        }
        tracing::debug!(
            exchange = %topology.exchange,
            queues = topology.queues.len(),
            "In-memory topology declared"
        );
        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish {
                queue: queue.to_string(),
                reason: "publishing disabled".to_string(),
            });
        }

        let channel = self.queue(queue);
        let delivery = message.into_delivery(queue);
        if self.publish_log {
            channel.published.lock().push(delivery.clone());
        }
        channel.sender.send(delivery).map_err(|_| BrokerError::Closed)?;

        metrics::counter!("broker_messages_published_total", "queue" => queue.to_string())
            .increment(1);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        use futures_util::stream;

        let receiver = self.queue(queue).receiver.clone();
        let stream = stream::unfold(receiver, |receiver| async move {
            let next = receiver.lock().await.recv().await;
            next.map(|delivery| (Ok(delivery), receiver))
        });
        Ok(Box::pin(stream))
    }
}
