// src/rabbitmq/consumer.rs
// Queue subscriptions for `consume`.

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::errors::Result;
use super::transport::{ConsumeOptions, QueueOptions, TransportChannel};
use crate::message::{Acker, Message, RawDelivery};

pub(crate) type DeliveryHandler =
    Arc<dyn Fn(RawDelivery, Arc<dyn TransportChannel>) -> BoxFuture<'static, ()> + Send + Sync>;

/// A consumer registration. Kept by the connection task so it can be
/// re-established after a reconnect.
#[derive(Clone)]
pub(crate) struct Subscription {
    pub(crate) queue: String,
    pub(crate) options: ConsumeOptions,
    pub(crate) handler: DeliveryHandler,
}

pub(crate) struct SubscribeRequest {
    pub(crate) subscription: Subscription,
    pub(crate) done: oneshot::Sender<Result<()>>,
    pub(crate) retried: bool,
}

/// Wrap a typed handler: decode the JSON body, attach the acker, log failures.
pub(crate) fn typed_handler<T, F, Fut>(queue: &str, handler: F) -> DeliveryHandler
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let handler = Arc::new(handler);
    let queue = queue.to_string();
    Arc::new(move |delivery: RawDelivery, channel: Arc<dyn TransportChannel>| {
        let handler = handler.clone();
        let queue = queue.clone();
        async move {
            let content: T = match serde_json::from_slice(&delivery.content) {
                Ok(content) => content,
                Err(e) => {
                    warn!(
                        queue = %queue,
                        delivery_tag = delivery.fields.delivery_tag,
                        error = %e,
                        "Failed to deserialize message, skipping"
                    );
                    return;
                }
            };
            let acker = Acker::new(channel, delivery.fields.delivery_tag);
            if let Err(e) = handler(Message::new(content, delivery, acker)).await {
                error!(queue = %queue, error = %e, "Message handler failed");
            }
        }
        .boxed()
    })
}

/// Declare the queue, bind it under its own name and start delivering to the handler.
pub(crate) async fn subscribe(
    channel: Arc<dyn TransportChannel>,
    exchange: &str,
    subscription: &Subscription,
) -> Result<JoinHandle<()>> {
    let queue = channel
        .assert_queue(
            &subscription.queue,
            QueueOptions {
                durable: subscription.options.durable_queue,
                exclusive: false,
                auto_delete: false,
            },
        )
        .await?;
    channel.bind_queue(&queue, exchange, &subscription.queue).await?;
    let mut deliveries = channel
        .consume(&queue, subscription.options.clone())
        .await?;

    info!(queue = %queue, exchange = %exchange, "Consumer subscribed");

    let handler = subscription.handler.clone();
    Ok(tokio::spawn(async move {
        while let Some(delivery) = deliveries.next().await {
            match delivery {
                Ok(delivery) => handler(delivery, channel.clone()).await,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Consumer stream failed");
                    break;
                }
            }
        }
        debug!(queue = %queue, "Consumer stopped");
    }))
}
