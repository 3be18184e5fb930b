use std::collections::HashMap;

use common::CorrelationId;

/// Header carrying the correlation identifier of a saga instance.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// A message received from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Queue the message was consumed from.
    pub queue: String,
    pub body: Vec<u8>,
    /// String-valued headers; other header types are dropped on receipt.
    pub headers: HashMap<String, String>,
}

impl Delivery {
    pub fn new(queue: impl Into<String>, body: Vec<u8>, headers: HashMap<String, String>) -> Self {
        Self {
            queue: queue.into(),
            body,
            headers,
        }
    }

    /// Returns the body as text, replacing invalid UTF-8 sequences.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Returns the correlation header if present and non-blank.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.headers
            .get(CORRELATION_HEADER)
            .and_then(CorrelationId::parse)
    }
}

/// A message to publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl OutboundMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            headers: HashMap::new(),
        }
    }

    /// Attaches the correlation header.
    pub fn with_correlation_id(mut self, correlation_id: &CorrelationId) -> Self {
        self.headers
            .insert(CORRELATION_HEADER.to_string(), correlation_id.to_string());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Turns this message into the delivery a consumer of `queue` sees.
    pub fn into_delivery(self, queue: impl Into<String>) -> Delivery {
        Delivery::new(queue, self.body, self.headers)
    }
}
