// src/rabbitmq/amqp_client.rs
// lapin-backed implementation of the transport traits.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, info};

use super::errors::{RabbitError, Result};
use super::transport::{
    ConsumeOptions, Connector, DeliveryStream, ExchangeKind, PublishOptions, QueueOptions,
    TransportChannel, TransportConnection,
};
use crate::message::{DeliveryFields, MessageProperties, RawDelivery};

/// Connects to a real broker through lapin.
#[derive(Debug, Default, Clone)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn TransportConnection>> {
        info!("Attempting to connect to RabbitMQ at {}", url);
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| RabbitError::Connection(format!("Failed to connect: {}", e)))?;
        info!("Successfully connected to RabbitMQ");
        Ok(Arc::new(LapinConnection { connection }))
    }
}

pub struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl TransportConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RabbitError::Channel(format!("Failed to create channel: {}", e)))?;
        debug!(channel_id = channel.id(), "Channel created");
        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        if self.connection.status().connected() {
            info!("Closing RabbitMQ connection gracefully");
            self.connection.close(200, "Closing connection").await?;
        }
        Ok(())
    }
}

pub struct LapinChannel {
    channel: Channel,
}

fn short(value: &str) -> ShortString {
    ShortString::from(value.to_string())
}

fn field_table(headers: &std::collections::BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(short(key), AMQPValue::LongString(value.clone().into()));
    }
    table
}

fn header_text(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        AMQPValue::ShortString(s) => s.as_str().to_string(),
        other => format!("{:?}", other),
    }
}

fn to_properties(options: &PublishOptions) -> BasicProperties {
    let mut properties = BasicProperties::default();
    if let Some(content_type) = &options.content_type {
        properties = properties.with_content_type(short(content_type));
    }
    if let Some(correlation_id) = &options.correlation_id {
        properties = properties.with_correlation_id(short(correlation_id));
    }
    if let Some(reply_to) = &options.reply_to {
        properties = properties.with_reply_to(short(reply_to));
    }
    if let Some(expiration) = &options.expiration {
        properties = properties.with_expiration(short(expiration));
    }
    if let Some(message_id) = &options.message_id {
        properties = properties.with_message_id(short(message_id));
    }
    if let Some(timestamp) = options.timestamp {
        properties = properties.with_timestamp(timestamp);
    }
    if let Some(priority) = options.priority {
        properties = properties.with_priority(priority);
    }
    if options.persistent {
        properties = properties.with_delivery_mode(2);
    }
    if !options.headers.is_empty() {
        properties = properties.with_headers(field_table(&options.headers));
    }
    properties
}

fn from_delivery(delivery: Delivery, consumer_tag: &str) -> RawDelivery {
    let props = &delivery.properties;
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());

    let headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.as_str().to_string(), header_text(value)))
                .collect()
        })
        .unwrap_or_default();

    let properties = MessageProperties {
        content_type: text(props.content_type()),
        correlation_id: text(props.correlation_id()),
        reply_to: text(props.reply_to()),
        expiration: text(props.expiration()),
        message_id: text(props.message_id()),
        timestamp: *props.timestamp(),
        priority: *props.priority(),
        headers,
    };

    let fields = DeliveryFields {
        delivery_tag: delivery.delivery_tag,
        consumer_tag: consumer_tag.to_string(),
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
    };

    RawDelivery {
        content: delivery.data,
        properties,
        fields,
    }
}

#[async_trait]
impl TransportChannel for LapinChannel {
    async fn assert_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitError::Channel(format!("Failed to declare exchange: {}", e)))
    }

    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitError::Channel(format!("Failed to declare queue: {}", e)))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitError::Channel(format!("Failed to bind queue: {}", e)))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        options: PublishOptions,
    ) -> Result<()> {
        let properties = to_properties(&options);
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    ..BasicPublishOptions::default()
                },
                &body,
                properties,
            )
            .await
            .map_err(|e| RabbitError::Publish(e.to_string()))?
            .await
            .map_err(|e| RabbitError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                options.consumer_tag.as_deref().unwrap_or(""),
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitError::Consume(format!("Failed to create consumer: {}", e)))?;

        let consumer_tag = consumer.tag().as_str().to_string();
        debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer started");

        let stream = consumer.map(move |delivery| {
            delivery
                .map(|delivery| from_delivery(delivery, &consumer_tag))
                .map_err(RabbitError::from)
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| RabbitError::Ack(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(200, "Closing channel").await?;
        }
        Ok(())
    }
}
