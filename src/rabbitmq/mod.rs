// src/rabbitmq/mod.rs
// RabbitMQ implementation for our messaging abstractions

pub mod errors;
pub mod transport;
pub mod amqp_client;
pub mod memory;
pub mod connection;
pub mod request_response;

// Private implementation details
pub(crate) mod publisher;
pub(crate) mod consumer;

// Re-export specific items to simplify imports elsewhere
pub use connection::ConnectionState;
pub use errors::{RabbitError, Result};
pub use request_response::RpcOptions;
pub use transport::{ConsumeOptions, ExchangeKind, PublishOptions};
