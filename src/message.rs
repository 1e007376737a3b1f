use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::rabbitmq::errors::Result;
use crate::rabbitmq::transport::TransportChannel;

/// AMQP basic properties carried by a delivery.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub priority: Option<u8>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Delivery metadata assigned by the broker.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryFields {
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
}

/// A message as handed over by the transport, body still encoded.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDelivery {
    pub content: Vec<u8>,
    pub properties: MessageProperties,
    pub fields: DeliveryFields,
}

impl RawDelivery {
    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }
}

/// Acknowledges one specific delivery on the channel it arrived on.
#[derive(Clone)]
pub struct Acker {
    channel: Arc<dyn TransportChannel>,
    delivery_tag: u64,
}

impl Acker {
    pub(crate) fn new(channel: Arc<dyn TransportChannel>, delivery_tag: u64) -> Self {
        Self {
            channel,
            delivery_tag,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.channel.ack(self.delivery_tag).await
    }
}

impl fmt::Debug for Acker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acker")
            .field("delivery_tag", &self.delivery_tag)
            .finish()
    }
}

/// A decoded message handed to `consume` handlers.
///
/// `ack` is always available. Calling it for a message consumed in no-ack mode
/// is a caller mistake and surfaces whatever error the transport reports.
#[derive(Debug, Clone)]
pub struct Message<T> {
    pub content: T,
    pub properties: MessageProperties,
    pub fields: DeliveryFields,
    acker: Acker,
}

impl<T> Message<T> {
    pub(crate) fn new(content: T, delivery: RawDelivery, acker: Acker) -> Self {
        Message {
            content,
            properties: delivery.properties,
            fields: delivery.fields,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub fn into_content(self) -> T {
        self.content
    }
}
