//! RabbitMQ broker built on `lapin`.
//!
//! Messages are published to a durable topic exchange with the destination
//! queue name as routing key. Consumers run with `no_ack`, so a delivery is
//! acknowledged as soon as the broker hands it over.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use parking_lot::RwLock;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::{debug, info, warn};

use crate::{
    BrokerError, Delivery, DeliveryStream, MessageBroker, OutboundMessage, Result, Topology,
};

/// Everything but RFC 3986 unreserved characters.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Connection settings for RabbitMQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub heartbeat: Duration,
    pub connection_timeout: Duration,
    pub max_channels: u16,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            heartbeat: Duration::from_secs(10),
            connection_timeout: Duration::from_millis(10_000),
            max_channels: 50,
        }
    }
}

impl AmqpConfig {
    /// Builds the AMQP URI, with heartbeat, timeout and channel limits as query parameters.
    ///
    /// Credentials and vhost are percent-encoded.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}&connection_timeout={}&channel_max={}",
            utf8_percent_encode(&self.username, URI_COMPONENT),
            utf8_percent_encode(&self.password, URI_COMPONENT),
            self.host,
            self.port,
            utf8_percent_encode(&self.vhost, URI_COMPONENT),
            self.heartbeat.as_secs(),
            self.connection_timeout.as_millis(),
            self.max_channels,
        )
    }
}

/// Broker backed by a RabbitMQ connection.
pub struct RabbitMqBroker {
    connection: Connection,
    publish_channel: Channel,
    exchange: RwLock<String>,
}

impl RabbitMqBroker {
    /// Connects and opens the channel used for publishing.
    ///
    /// Messages are published to `exchange`; call [`declare_topology`](MessageBroker::declare_topology)
    /// before publishing if the exchange may not exist yet.
    pub async fn connect(config: &AmqpConfig, exchange: impl Into<String>) -> Result<Self> {
        let connection = Connection::connect(&config.uri(), ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let publish_channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("channel creation failed: {e}")))?;

        info!(host = %config.host, port = config.port, vhost = %config.vhost, "Connected to RabbitMQ");

        Ok(Self {
            connection,
            publish_channel,
            exchange: RwLock::new(exchange.into()),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<()> {
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|e| BrokerError::Connection(format!("close failed: {e}")))?;
        info!("RabbitMQ connection closed");
        Ok(())
    }

    fn to_field_table(headers: &HashMap<String, String>) -> FieldTable {
        let mut table = FieldTable::default();
        for (key, value) in headers {
            table.insert(
                key.as_str().into(),
                AMQPValue::LongString(value.as_str().into()),
            );
        }
        table
    }

    fn from_field_table(table: Option<&FieldTable>) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        if let Some(table) = table {
            for (key, value) in table.inner() {
                let text = match value {
                    AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                    AMQPValue::ShortString(s) => s.as_str().to_string(),
                    _ => continue,
                };
                headers.insert(key.as_str().to_string(), text);
            }
        }
        headers
    }
}

#[async_trait]
impl MessageBroker for RabbitMqBroker {
    async fn declare_topology(&self, topology: &Topology) -> Result<()> {
        let channel = &self.publish_channel;

        channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                name: topology.exchange.clone(),
                reason: e.to_string(),
            })?;

        for queue in &topology.queues {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Declare {
                    name: queue.clone(),
                    reason: e.to_string(),
                })?;

            channel
                .queue_bind(
                    queue,
                    &topology.exchange,
                    queue,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Declare {
                    name: format!("{queue} -> {}", topology.exchange),
                    reason: e.to_string(),
                })?;

            debug!(queue = %queue, exchange = %topology.exchange, "Queue declared and bound");
        }

        *self.exchange.write() = topology.exchange.clone();
        info!(
            exchange = %topology.exchange,
            queues = topology.queues.len(),
            "RabbitMQ topology declared"
        );
        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()> {
        let exchange = self.exchange.read().clone();
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_headers(Self::to_field_table(&message.headers));

        let confirm = self
            .publish_channel
            .basic_publish(
                &exchange,
                queue,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        confirm.await.map_err(|e| BrokerError::Publish {
            queue: queue.to_string(),
            reason: format!("confirmation failed: {e}"),
        })?;

        metrics::counter!("broker_messages_published_total", "queue" => queue.to_string())
            .increment(1);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Consume {
                queue: queue.to_string(),
                reason: format!("channel creation failed: {e}"),
            })?;

        let consumer_tag = format!("saga-{queue}-{}", common::ExecutionId::new());
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer started");

        let queue = queue.to_string();
        let stream = consumer.map(move |result| {
            // Consumer channel must outlive the stream.
            let _channel = &channel;
            match result {
                Ok(delivery) => {
                    let headers = Self::from_field_table(delivery.properties.headers().as_ref());
                    Ok(Delivery::new(queue.clone(), delivery.data, headers))
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Consumer error");
                    Err(BrokerError::Consume {
                        queue: queue.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
