// src/rabbitmq/transport.rs
// The narrow broker interface the client is written against.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::errors::Result;
use crate::message::RawDelivery;

pub type DeliveryStream = BoxStream<'static, Result<RawDelivery>>;

/// Exchange types understood by [`TransportChannel::assert_exchange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

impl Default for ExchangeKind {
    fn default() -> Self {
        ExchangeKind::Topic
    }
}

/// Queue declaration flags. An empty queue name asks the broker to pick one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// Publish options, forwarded to the transport as-is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Per-message TTL in milliseconds, as the AMQP string property expects.
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub priority: Option<u8>,
    pub persistent: bool,
    pub mandatory: bool,
    pub headers: BTreeMap<String, String>,
}

impl PublishOptions {
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

/// Consume options. `no_ack` defaults to true.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub no_ack: bool,
    pub exclusive: bool,
    pub consumer_tag: Option<String>,
    /// Declare the consumed queue as durable.
    pub durable_queue: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            no_ack: true,
            exclusive: false,
            consumer_tag: None,
            durable_queue: true,
        }
    }
}

impl ConsumeOptions {
    /// Consume with explicit acknowledgement.
    pub fn manual_ack() -> Self {
        Self {
            no_ack: false,
            ..Self::default()
        }
    }
}

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Arc<dyn TransportConnection>>;
}

#[async_trait]
pub trait TransportConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn assert_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    /// Declares a queue and returns its name (server-generated when `name` is empty).
    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        options: PublishOptions,
    ) -> Result<()>;

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
