//! Message-broker capability for saga steps.
//!
//! The [`MessageBroker`] trait covers what the saga engine needs from a broker:
//! idempotent topology declaration, publishing with a correlation header, and
//! auto-acknowledged consumption. [`InMemoryBroker`] runs in-process;
//! [`RabbitMqBroker`] talks AMQP 0.9.1 through `lapin`.

pub mod broker;
pub mod error;
pub mod memory;
pub mod message;
pub mod rabbitmq;
pub mod topology;

pub use broker::{DeliveryStream, MessageBroker};
pub use error::{BrokerError, Result};
pub use memory::InMemoryBroker;
pub use message::{CORRELATION_HEADER, Delivery, OutboundMessage};
pub use rabbitmq::{AmqpConfig, RabbitMqBroker};
pub use topology::Topology;
