//! Payload codec for step inputs and outputs.
//!
//! A step declares a [`PayloadKind`] for its input and its output. `Json`
//! values travel as JSON text; `Text` values travel verbatim.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{Result, SagaError};

/// Declared wire type of a step input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadKind {
    /// Structured JSON.
    Json,
    /// Raw text, passed through unchanged.
    #[default]
    Text,
}

/// A decoded step input or a step result waiting to be encoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
}

impl Payload {
    /// Decodes a raw message body for `step` according to `kind`.
    pub fn decode(step: &str, raw: &str, kind: PayloadKind) -> Result<Self> {
        match kind {
            PayloadKind::Json => serde_json::from_str(raw)
                .map(Payload::Json)
                .map_err(|e| SagaError::Decode {
                    step: step.to_string(),
                    reason: e.to_string(),
                }),
            PayloadKind::Text => Ok(Payload::Text(raw.to_string())),
        }
    }

    /// Encodes this payload as the output of `step` according to `kind`.
    ///
    /// `Text` output of a JSON string is the string itself, not its quoted form.
    pub fn encode(&self, step: &str, kind: PayloadKind) -> Result<String> {
        match (kind, self) {
            (PayloadKind::Json, Payload::Json(value)) => {
                serde_json::to_string(value).map_err(|e| SagaError::Encode {
                    step: step.to_string(),
                    reason: e.to_string(),
                })
            }
            (PayloadKind::Json, Payload::Text(text)) => {
                serde_json::to_string(text).map_err(|e| SagaError::Encode {
                    step: step.to_string(),
                    reason: e.to_string(),
                })
            }
            (PayloadKind::Text, Payload::Json(Value::String(text))) => Ok(text.clone()),
            (PayloadKind::Text, Payload::Json(value)) => Ok(value.to_string()),
            (PayloadKind::Text, Payload::Text(text)) => Ok(text.clone()),
        }
    }

    /// Serializes `value` into a JSON payload.
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    /// Deserializes the payload into `T`.
    ///
    /// Text payloads are parsed as JSON first.
    pub fn parse_json<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            Payload::Json(value) => Ok(serde_json::from_value(value)?),
            Payload::Text(text) => Ok(serde_json::from_str(&text)?),
        }
    }

    /// Returns the payload as text; JSON strings are unquoted.
    pub fn into_text(self) -> String {
        match self {
            Payload::Text(text) | Payload::Json(Value::String(text)) => text,
            Payload::Json(value) => value.to_string(),
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}
