// Shared helpers: a client wired to an in-memory broker and a scripted RPC
// server on the other side of it.
#![allow(dead_code)]

use futures::StreamExt;
use rabbit_rpc::message::RawDelivery;
use rabbit_rpc::rabbitmq::transport::{
    ConsumeOptions, Connector, ExchangeKind, PublishOptions, QueueOptions, TransportChannel,
};
use rabbit_rpc::{ClientConfig, MemoryBroker, RabbitClient};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const EXCHANGE: &str = "rpc";

pub fn config() -> ClientConfig {
    ClientConfig::new("memory://test", EXCHANGE).with_reconnect_policy(3, 10)
}

pub fn client(broker: &MemoryBroker) -> RabbitClient {
    RabbitClient::with_connector(config(), Arc::new(broker.clone())).unwrap()
}

pub async fn server_channel(broker: &MemoryBroker) -> Arc<dyn TransportChannel> {
    let connection = broker.connect("memory://server").await.unwrap();
    let channel = connection.create_channel().await.unwrap();
    channel
        .assert_exchange(EXCHANGE, ExchangeKind::Topic)
        .await
        .unwrap();
    channel
}

/// Subscribe to `queue` on the exchange and forward every delivery.
pub async fn listen(broker: &MemoryBroker, queue: &str) -> mpsc::UnboundedReceiver<RawDelivery> {
    let channel = server_channel(broker).await;
    channel
        .assert_queue(queue, QueueOptions::default())
        .await
        .unwrap();
    channel.bind_queue(queue, EXCHANGE, queue).await.unwrap();
    let mut deliveries = channel
        .consume(queue, ConsumeOptions::default())
        .await
        .unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        // Keep the channel alive for as long as we listen.
        let _channel = channel;
        while let Some(Ok(delivery)) = deliveries.next().await {
            if tx.send(delivery).is_err() {
                break;
            }
        }
    });
    rx
}

/// Publish `envelope` as the reply to `request`.
pub async fn reply(channel: &Arc<dyn TransportChannel>, request: &RawDelivery, envelope: Value) {
    let reply_to = request.properties.reply_to.clone().expect("request has reply_to");
    let options = PublishOptions {
        correlation_id: request.properties.correlation_id.clone(),
        content_type: Some("application/json".to_string()),
        ..PublishOptions::default()
    };
    channel
        .publish(
            EXCHANGE,
            &reply_to,
            serde_json::to_vec(&envelope).unwrap(),
            options,
        )
        .await
        .unwrap();
}

/// An RPC server answering requests on `routing_key` with whatever `respond`
/// returns for the decoded request body, after `delay`. `None` means no reply.
pub async fn spawn_responder<F>(
    broker: &MemoryBroker,
    routing_key: &str,
    delay: Duration,
    respond: F,
) -> JoinHandle<()>
where
    F: Fn(Value) -> Option<Value> + Send + Sync + 'static,
{
    let mut requests = listen(broker, routing_key).await;
    let channel = server_channel(broker).await;
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let body: Value = serde_json::from_slice(&request.content).unwrap();
            if let Some(envelope) = respond(body) {
                let channel = channel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    reply(&channel, &request, envelope).await;
                });
            }
        }
    })
}

pub fn reply_queue(broker: &MemoryBroker) -> Option<String> {
    broker
        .queue_names()
        .into_iter()
        .find(|name| name.starts_with("amq.gen-"))
}
