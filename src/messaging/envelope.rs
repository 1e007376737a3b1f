// src/messaging/envelope.rs
// Reply payloads produced by RPC consumers and how they map to call outcomes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rabbitmq::errors::RabbitError;

/// Wire shape of an RPC reply: `{ "data": .., "error": .., "trace": .. }`.
///
/// `error` and `trace` are kept as raw JSON so that any truthy value counts,
/// not only `true` and non-empty strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub error: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub trace: Value,
}

impl ReplyEnvelope {
    pub fn success(data: Value) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn client_error(messages: Vec<String>) -> Self {
        Self {
            data: Value::from(messages),
            error: Value::Bool(true),
            trace: Value::Null,
        }
    }

    pub fn fatal(trace: impl Into<String>) -> Self {
        Self {
            data: Value::Null,
            error: Value::Bool(true),
            trace: Value::String(trace.into()),
        }
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, RabbitError> {
        serde_json::from_slice(body).map_err(|e| RabbitError::Deserialization(e.to_string()))
    }
}

/// Result of classifying a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    ClientError(Vec<String>),
    ConsumerFailure,
}

impl Outcome {
    pub fn into_result(self) -> Result<Value, RabbitError> {
        match self {
            Outcome::Success(data) => Ok(data),
            Outcome::ClientError(messages) => Err(RabbitError::ClientInput { messages }),
            Outcome::ConsumerFailure => Err(RabbitError::ConsumerFailure),
        }
    }
}

/// JavaScript-style truthiness, which is what reply producers assume.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn client_messages(data: Value) -> Vec<String> {
    let text = |value: Value| match value {
        Value::String(s) => s,
        other => other.to_string(),
    };
    match data {
        Value::Null => Vec::new(),
        Value::Array(items) => items.into_iter().map(text).collect(),
        other => vec![text(other)],
    }
}

/// Decide the outcome of a reply. A trace only marks the failure as fatal;
/// its content never leaves this function.
pub fn classify(envelope: ReplyEnvelope) -> Outcome {
    if !is_truthy(&envelope.error) {
        return Outcome::Success(envelope.data);
    }
    if is_truthy(&envelope.trace) {
        Outcome::ConsumerFailure
    } else {
        Outcome::ClientError(client_messages(envelope.data))
    }
}
