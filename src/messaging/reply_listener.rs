// src/messaging/reply_listener.rs

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::envelope::{is_truthy, ReplyEnvelope};
use super::registry::CorrelationRegistry;
use crate::message::RawDelivery;
use crate::rabbitmq::errors::RabbitError;
use crate::rabbitmq::transport::DeliveryStream;

/// Drain the reply queue subscription into the registry. The task ends when
/// the subscription ends, which the connection task treats as a lost channel.
pub fn spawn_reply_listener(
    mut replies: DeliveryStream,
    registry: CorrelationRegistry,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(delivery) = replies.next().await {
            match delivery {
                Ok(delivery) => {
                    handle_reply(&registry, delivery);
                }
                Err(e) => {
                    warn!(error = %e, "Reply subscription failed");
                    break;
                }
            }
        }
        debug!("Reply listener stopped");
    })
}

/// Route one reply to its pending call. Returns whether a call was settled;
/// replies nobody is waiting for are dropped.
pub fn handle_reply(registry: &CorrelationRegistry, delivery: RawDelivery) -> bool {
    let Some(correlation_id) = delivery.correlation_id() else {
        debug!("Dropping reply without correlation id");
        return false;
    };
    if !registry.contains(correlation_id) {
        debug!(correlation_id = %correlation_id, "Dropping unmatched reply");
        return false;
    }

    match ReplyEnvelope::from_slice(&delivery.content) {
        Ok(envelope) => {
            if is_truthy(&envelope.error) && is_truthy(&envelope.trace) {
                warn!(
                    correlation_id = %correlation_id,
                    trace = %envelope.trace,
                    "RPC consumer reported a fatal error"
                );
            }
            registry.resolve(correlation_id, envelope)
        }
        Err(e) => {
            warn!(correlation_id = %correlation_id, error = %e, "Malformed RPC reply");
            registry.reject(correlation_id, RabbitError::ConsumerFailure)
        }
    }
}
