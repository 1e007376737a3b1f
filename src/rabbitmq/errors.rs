// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabbitError {
    /// No reply arrived within the configured window.
    #[error("RPC request timed out after {}ms", .timeout.as_millis())]
    Timeout { timeout: Duration },

    /// The remote consumer rejected the request as invalid.
    #[error("RPC request rejected by consumer: {}", .messages.join("; "))]
    ClientInput { messages: Vec<String> },

    /// The remote consumer failed while handling the request. Carries no detail on purpose.
    #[error("RPC consumer failed to process the request")]
    ConsumerFailure,

    #[error("RabbitMQ connection error: {0}")]
    Connection(String),

    #[error("RabbitMQ channel error: {0}")]
    Channel(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] SerdeError),

    #[error("Message deserialization error: {0}")]
    Deserialization(String),

    #[error("RabbitMQ publish error: {0}")]
    Publish(String),

    #[error("RabbitMQ consume error: {0}")]
    Consume(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    Ack(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Correlation id {0} is already registered")]
    DuplicateCorrelationId(String),

    #[error("Gave up connecting to RabbitMQ after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Client has been closed")]
    Closed,
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitError>;

impl RabbitError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RabbitError::Timeout { .. })
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, RabbitError::ClientInput { .. })
    }

    pub fn is_consumer_failure(&self) -> bool {
        matches!(self, RabbitError::ConsumerFailure)
    }

    /// Messages reported by the consumer for a rejected request, if this is a client input error.
    pub fn client_messages(&self) -> Option<&[String]> {
        match self {
            RabbitError::ClientInput { messages } => Some(messages),
            _ => None,
        }
    }

    /// Whether the failure came from the transport rather than from the remote consumer.
    pub(crate) fn is_transport(&self) -> bool {
        matches!(
            self,
            RabbitError::Connection(_)
                | RabbitError::Channel(_)
                | RabbitError::Publish(_)
                | RabbitError::Consume(_)
        )
    }
}

// Converting from lapin errors
impl From<LapinError> for RabbitError {
    fn from(error: LapinError) -> Self {
        // Use string representation for classification
        let error_text = error.to_string();
        let lowered = error_text.to_lowercase();

        if lowered.contains("connection") || lowered.contains("io error") {
            RabbitError::Connection(error_text)
        } else if lowered.contains("channel") {
            RabbitError::Channel(error_text)
        } else if lowered.contains("publish") {
            RabbitError::Publish(error_text)
        } else if lowered.contains("consume") {
            RabbitError::Consume(error_text)
        } else if lowered.contains("ack") {
            RabbitError::Ack(error_text)
        } else {
            RabbitError::Channel(error_text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_mentions_the_window() {
        let err = RabbitError::Timeout {
            timeout: Duration::from_millis(50),
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("50"));
    }

    #[test]
    fn client_messages_only_for_client_errors() {
        let err = RabbitError::ClientInput {
            messages: vec!["bad field".to_string()],
        };
        assert!(err.is_client_error());
        assert_eq!(err.client_messages(), Some(&["bad field".to_string()][..]));
        assert_eq!(RabbitError::ConsumerFailure.client_messages(), None);
    }

    #[test]
    fn consumer_failure_is_opaque() {
        let err = RabbitError::ConsumerFailure;
        assert!(err.is_consumer_failure());
        assert!(!err.to_string().contains("trace"));
    }

    #[test]
    fn transport_errors_are_flagged() {
        assert!(RabbitError::Channel("gone".into()).is_transport());
        assert!(!RabbitError::Closed.is_transport());
        assert!(!RabbitError::ConsumerFailure.is_transport());
    }
}
