// src/rabbitmq/memory.rs
// In-process broker implementing the transport traits. Routing follows AMQP
// rules closely enough for exercising the client without a RabbitMQ server.

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::errors::{RabbitError, Result};
use super::transport::{
    ConsumeOptions, Connector, DeliveryStream, ExchangeKind, PublishOptions, QueueOptions,
    TransportChannel, TransportConnection,
};
use crate::message::{DeliveryFields, MessageProperties, RawDelivery};

struct ConsumerSlot {
    connection: u64,
    tag: String,
    no_ack: bool,
    sender: UnboundedSender<Result<RawDelivery>>,
}

struct QueueState {
    owner: Option<u64>,
    auto_delete: bool,
    messages: VecDeque<RawDelivery>,
    consumer: Option<ConsumerSlot>,
}

struct Binding {
    exchange: String,
    queue: String,
    key: String,
}

#[derive(Default)]
struct BrokerState {
    next_connection: u64,
    next_tag: u64,
    next_consumer: u64,
    open: HashSet<u64>,
    connect_failures: u32,
    connect_attempts: u32,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, u64>,
    acked: Vec<u64>,
}

/// Shared handle to an in-memory broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

/// Topic matching: `*` is exactly one word, `#` is zero or more.
fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            topic_matches(&pattern[1..], key) || (!key.is_empty() && topic_matches(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => topic_matches(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) if p == k => topic_matches(&pattern[1..], &key[1..]),
        _ => false,
    }
}

fn binding_matches(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout => true,
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let key: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &key)
        }
    }
}

impl BrokerState {
    fn ensure_open(&self, connection: u64) -> Result<()> {
        if self.open.contains(&connection) {
            Ok(())
        } else {
            Err(RabbitError::Channel("channel is closed".to_string()))
        }
    }

    fn deliver(&mut self, queue_name: &str, mut delivery: RawDelivery) {
        self.next_tag += 1;
        let tag = self.next_tag;
        delivery.fields.delivery_tag = tag;

        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        match queue.consumer.take() {
            Some(slot) if !slot.sender.is_closed() => {
                delivery.fields.consumer_tag = slot.tag.clone();
                match slot.sender.unbounded_send(Ok(delivery)) {
                    Ok(()) => {
                        if !slot.no_ack {
                            self.unacked.insert(tag, slot.connection);
                        }
                        queue.consumer = Some(slot);
                    }
                    Err(err) => {
                        if let Ok(delivery) = err.into_inner() {
                            queue.messages.push_back(delivery);
                        }
                    }
                }
            }
            _ => queue.messages.push_back(delivery),
        }
    }

    fn drop_connection(&mut self, connection: u64) {
        if !self.open.remove(&connection) {
            return;
        }
        for queue in self.queues.values_mut() {
            if queue
                .consumer
                .as_ref()
                .is_some_and(|slot| slot.connection == connection)
            {
                // Dropping the sender ends the consumer's stream.
                queue.consumer = None;
            }
        }
        let removed: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection) || (q.auto_delete && q.consumer.is_none()))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &removed {
            self.queues.remove(name);
        }
        self.bindings.retain(|b| !removed.contains(&b.queue));
        self.unacked.retain(|_, owner| *owner != connection);
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only means a test panicked mid-operation.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().connect_failures = count;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    /// Drop every open connection, as if the broker went away.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let open: Vec<u64> = state.open.iter().copied().collect();
        for connection in open {
            state.drop_connection(connection);
        }
        debug!("Memory broker dropped all connections");
    }

    pub fn open_connections(&self) -> usize {
        self.lock().open.len()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.lock().queues.keys().cloned().collect()
    }

    /// Binding keys connecting `queue` to `exchange`.
    pub fn bindings(&self, queue: &str, exchange: &str) -> Vec<String> {
        self.lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue && b.exchange == exchange)
            .map(|b| b.key.clone())
            .collect()
    }

    /// Messages sitting in `queue` with no consumer to take them.
    pub fn message_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    pub fn acked(&self) -> Vec<u64> {
        self.lock().acked.clone()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn TransportConnection>> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(RabbitError::Connection(format!(
                "connection refused by {}",
                url
            )));
        }
        state.next_connection += 1;
        let id = state.next_connection;
        state.open.insert(id);
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>> {
        self.broker.lock().ensure_open(self.id)?;
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            connection: self.id,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().drop_connection(self.id);
        Ok(())
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    connection: u64,
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    async fn assert_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.connection)?;
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(RabbitError::Channel(format!(
                "PRECONDITION_FAILED - exchange '{}' already declared as {:?}",
                name, existing
            ))),
            _ => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let mut state = self.broker.lock();
        state.ensure_open(self.connection)?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };
        match state.queues.get(&name) {
            Some(queue) if queue.owner.is_some_and(|owner| owner != self.connection) => {
                Err(RabbitError::Channel(format!(
                    "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                    name
                )))
            }
            Some(_) => Ok(name),
            None => {
                state.queues.insert(
                    name.clone(),
                    QueueState {
                        owner: options.exclusive.then_some(self.connection),
                        auto_delete: options.auto_delete,
                        messages: VecDeque::new(),
                        consumer: None,
                    },
                );
                Ok(name)
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.connection)?;
        if !state.queues.contains_key(queue) {
            return Err(RabbitError::Channel(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(RabbitError::Channel(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.key == binding_key);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                key: binding_key.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        options: PublishOptions,
    ) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.connection)?;

        let targets: Vec<String> = if exchange.is_empty() {
            state
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else {
            let kind = *state.exchanges.get(exchange).ok_or_else(|| {
                RabbitError::Publish(format!("NOT_FOUND - no exchange '{}'", exchange))
            })?;
            let mut seen = HashSet::new();
            state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange && binding_matches(kind, &b.key, routing_key))
                .filter(|b| seen.insert(b.queue.clone()))
                .map(|b| b.queue.clone())
                .collect()
        };

        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "Unroutable message dropped");
            return Ok(());
        }

        let properties = MessageProperties {
            content_type: options.content_type,
            correlation_id: options.correlation_id,
            reply_to: options.reply_to,
            expiration: options.expiration,
            message_id: options.message_id,
            timestamp: options.timestamp,
            priority: options.priority,
            headers: options.headers,
        };
        for queue in targets {
            let delivery = RawDelivery {
                content: body.clone(),
                properties: properties.clone(),
                fields: DeliveryFields {
                    delivery_tag: 0,
                    consumer_tag: String::new(),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                },
            };
            state.deliver(&queue, delivery);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream> {
        let mut state = self.broker.lock();
        state.ensure_open(self.connection)?;
        state.next_consumer += 1;
        let tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("amq.ctag-{}", state.next_consumer));

        let (sender, receiver) = mpsc::unbounded();
        let backlog: Vec<RawDelivery> = {
            let entry = state.queues.get_mut(queue).ok_or_else(|| {
                RabbitError::Consume(format!("NOT_FOUND - no queue '{}'", queue))
            })?;
            if entry
                .consumer
                .as_ref()
                .is_some_and(|slot| !slot.sender.is_closed())
            {
                return Err(RabbitError::Consume(format!(
                    "ACCESS_REFUSED - queue '{}' already has a consumer",
                    queue
                )));
            }
            entry.consumer = Some(ConsumerSlot {
                connection: self.connection,
                tag,
                no_ack: options.no_ack,
                sender,
            });
            entry.messages.drain(..).collect()
        };
        for delivery in backlog {
            state.deliver(queue, delivery);
        }
        Ok(receiver.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.connection)?;
        match state.unacked.get(&delivery_tag) {
            Some(owner) if *owner == self.connection => {
                state.unacked.remove(&delivery_tag);
                state.acked.push(delivery_tag);
                Ok(())
            }
            _ => Err(RabbitError::Ack(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            ))),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
