// src/rabbitmq/request_response.rs
// RPC call coordination: one correlation id, one pending call and one timer per request.

use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::connection::Dispatch;
use super::transport::{PublishOptions, TransportChannel};
use crate::messaging::registry::{CorrelationRegistry, PendingCall, Responder};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Per-call RPC options.
#[derive(Debug, Clone, Default)]
pub struct RpcOptions {
    /// Overrides the client's default RPC timeout.
    pub timeout: Option<Duration>,
    /// Extra publish options forwarded with the request. Content type,
    /// correlation id, reply-to and expiration are always set by the client.
    pub publish: PublishOptions,
}

impl RpcOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn with_timeout_ms(timeout_ms: u64) -> Self {
        Self::with_timeout(Duration::from_millis(timeout_ms))
    }

    pub fn publish_options(mut self, publish: PublishOptions) -> Self {
        self.publish = publish;
        self
    }
}

/// An RPC request waiting for the dispatcher.
pub(crate) struct RpcRequest {
    pub(crate) routing_key: String,
    pub(crate) body: Vec<u8>,
    pub(crate) timeout: Duration,
    pub(crate) options: PublishOptions,
    pub(crate) responder: Responder,
    pub(crate) retried: bool,
}

impl RpcRequest {
    pub(crate) fn new(
        routing_key: &str,
        body: Vec<u8>,
        timeout: Duration,
        options: PublishOptions,
        responder: Responder,
    ) -> Self {
        Self {
            routing_key: routing_key.to_string(),
            body,
            timeout,
            options,
            responder,
            retried: false,
        }
    }
}

/// Register the call, arm its timer and publish the request. If publishing
/// fails the call is withdrawn unsettled and handed back for a retry.
pub(crate) async fn dispatch(
    channel: &dyn TransportChannel,
    exchange: &str,
    reply_queue: &str,
    registry: &CorrelationRegistry,
    request: RpcRequest,
) -> Dispatch<RpcRequest> {
    let RpcRequest {
        routing_key,
        body,
        timeout,
        mut options,
        responder,
        retried,
    } = request;

    let correlation_id = Uuid::new_v4().to_string();
    if registry
        .register(&correlation_id, PendingCall::new(responder, timeout))
        .is_err()
    {
        // The registry already settled the call.
        return Ok(());
    }
    registry.arm_timeout(&correlation_id);

    options.content_type = Some(JSON_CONTENT_TYPE.to_string());
    options.correlation_id = Some(correlation_id.clone());
    options.reply_to = Some(reply_queue.to_string());
    options.expiration = Some(timeout.as_millis().to_string());

    debug!(
        correlation_id = %correlation_id,
        routing_key = %routing_key,
        timeout_ms = timeout.as_millis() as u64,
        "Publishing RPC request"
    );

    match channel
        .publish(exchange, &routing_key, body.clone(), options.clone())
        .await
    {
        Ok(()) => Ok(()),
        Err(error) => match registry.cancel(&correlation_id) {
            Some(responder) => Err((
                error,
                RpcRequest {
                    routing_key,
                    body,
                    timeout,
                    options,
                    responder,
                    retried,
                },
            )),
            // Timed out while the publish was in flight.
            None => Ok(()),
        },
    }
}
