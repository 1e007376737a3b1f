// src/rabbitmq/publisher.rs
// Fire-and-forget publishing.

use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use super::connection::Dispatch;
use super::errors::Result;
use super::request_response::JSON_CONTENT_TYPE;
use super::transport::{PublishOptions, TransportChannel};

pub(crate) struct PublishRequest {
    pub(crate) routing_key: String,
    pub(crate) body: Vec<u8>,
    pub(crate) options: PublishOptions,
    pub(crate) done: oneshot::Sender<Result<()>>,
    pub(crate) retried: bool,
}

impl PublishRequest {
    pub(crate) fn new(
        routing_key: &str,
        body: Vec<u8>,
        options: PublishOptions,
        done: oneshot::Sender<Result<()>>,
    ) -> Self {
        Self {
            routing_key: routing_key.to_string(),
            body,
            options: with_message_defaults(options),
            done,
            retried: false,
        }
    }
}

/// Fill in content type, message id and timestamp when the caller left them unset.
pub(crate) fn with_message_defaults(mut options: PublishOptions) -> PublishOptions {
    options
        .content_type
        .get_or_insert_with(|| JSON_CONTENT_TYPE.to_string());
    options
        .message_id
        .get_or_insert_with(|| Uuid::new_v4().to_string());
    options
        .timestamp
        .get_or_insert_with(|| chrono::Utc::now().timestamp() as u64);
    options
}

pub(crate) async fn dispatch(
    channel: &dyn TransportChannel,
    exchange: &str,
    request: PublishRequest,
) -> Dispatch<PublishRequest> {
    match channel
        .publish(
            exchange,
            &request.routing_key,
            request.body.clone(),
            request.options.clone(),
        )
        .await
    {
        Ok(()) => {
            debug!(
                "Published message to exchange '{}' with routing key '{}'",
                exchange, request.routing_key
            );
            let _ = request.done.send(Ok(()));
            Ok(())
        }
        Err(error) => Err((error, request)),
    }
}
