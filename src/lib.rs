//! Publish, consume and request/reply RPC over a RabbitMQ exchange.
//!
//! RPC calls share one private reply queue per client and are matched to
//! their replies by correlation id. Each call settles exactly once: with the
//! reply data, a timeout, a client input error, or an opaque consumer failure.

pub mod config;
pub mod env;
pub mod message;
pub mod messaging;
pub mod rabbitmq;
pub mod rabbitmq_client;

pub use config::{ClientConfig, ReconnectPolicy};
pub use message::{Message, MessageProperties};
pub use messaging::ReplyEnvelope;
pub use rabbitmq::memory::MemoryBroker;
pub use rabbitmq::{
    ConnectionState, ConsumeOptions, ExchangeKind, PublishOptions, RabbitError, Result,
    RpcOptions,
};
pub use rabbitmq_client::RabbitClient;
