// src/rabbitmq_client.rs
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, instrument};

use crate::config::ClientConfig;
use crate::message::Message;
use crate::messaging::registry::CorrelationRegistry;
use crate::rabbitmq::amqp_client::LapinConnector;
use crate::rabbitmq::connection::{Command, ConnectionState, Dispatcher};
use crate::rabbitmq::consumer::{typed_handler, SubscribeRequest, Subscription};
use crate::rabbitmq::errors::{RabbitError, Result};
use crate::rabbitmq::publisher::PublishRequest;
use crate::rabbitmq::request_response::{RpcOptions, RpcRequest};
use crate::rabbitmq::transport::{ConsumeOptions, Connector, PublishOptions};

/// Publish, consume and RPC over one exchange.
///
/// Every client owns one connection, one channel and one private reply queue
/// shared by all of its outstanding RPC calls. Construction returns right away;
/// requests made before the channel is up are held and sent once it is.
pub struct RabbitClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    registry: CorrelationRegistry,
    config: ClientConfig,
}

impl RabbitClient {
    /// Connect to RabbitMQ through lapin. Must be called inside a tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(LapinConnector))
    }

    /// Connect through any transport implementation.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        info!(exchange = %config.exchange, "Starting RabbitMQ client");

        let registry = CorrelationRegistry::new();
        let (commands, state) = Dispatcher::spawn(config.clone(), connector, registry.clone());
        Ok(Self {
            commands,
            state,
            registry,
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Number of RPC calls waiting for a reply or a timeout.
    pub fn pending_calls(&self) -> usize {
        self.registry.len()
    }

    /// Wait until the channel is usable. Fails once the client is closed or
    /// has given up reconnecting.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut state = self.state.clone();
        loop {
            match &*state.borrow_and_update() {
                ConnectionState::Ready => return Ok(()),
                ConnectionState::Failed { attempts } => {
                    return Err(RabbitError::RetriesExhausted {
                        attempts: *attempts,
                    })
                }
                ConnectionState::Closed => return Err(RabbitError::Closed),
                ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {}
            }
            state.changed().await.map_err(|_| RabbitError::Closed)?;
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| RabbitError::Closed)
    }

    /// Fire-and-forget publish of a JSON payload under `routing_key`.
    pub async fn publish<T>(&self, routing_key: &str, payload: &T, options: PublishOptions) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload)?;
        let (done, rx) = oneshot::channel();
        self.send(Command::Publish(PublishRequest::new(
            routing_key,
            body,
            options,
            done,
        )))?;
        rx.await.map_err(|_| RabbitError::Closed)?
    }

    /// Declare `queue_key`, bind it to the exchange under the same name and
    /// hand every decoded message to `handler`. The subscription is restored
    /// after a reconnect.
    pub async fn consume<T, F, Fut>(
        &self,
        queue_key: &str,
        handler: F,
        options: ConsumeOptions,
    ) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if queue_key.is_empty() {
            return Err(RabbitError::InvalidArgument(
                "queue key cannot be empty".to_string(),
            ));
        }
        let subscription = Subscription {
            queue: queue_key.to_string(),
            options,
            handler: typed_handler(queue_key, handler),
        };
        let (done, rx) = oneshot::channel();
        self.send(Command::Subscribe(SubscribeRequest {
            subscription,
            done,
            retried: false,
        }))?;
        rx.await.map_err(|_| RabbitError::Closed)?
    }

    /// Send a request and wait for its reply.
    ///
    /// Settles exactly once: with the reply's `data`, or with a timeout,
    /// client input or consumer failure error.
    #[instrument(skip(self, payload, options))]
    pub async fn rpc_exec<T, R>(&self, routing_key: &str, payload: &T, options: RpcOptions) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if routing_key.is_empty() {
            return Err(RabbitError::InvalidArgument(
                "routing key cannot be empty".to_string(),
            ));
        }
        let timeout = options.timeout.unwrap_or_else(|| self.config.rpc_timeout());
        if timeout.is_zero() {
            return Err(RabbitError::InvalidArgument(
                "timeout must be positive".to_string(),
            ));
        }

        let body = serde_json::to_vec(payload)?;
        let (responder, rx) = oneshot::channel();
        self.send(Command::Rpc(RpcRequest::new(
            routing_key,
            body,
            timeout,
            options.publish,
            responder,
        )))?;

        let data = rx.await.map_err(|_| RabbitError::Closed)??;
        serde_json::from_value(data).map_err(|e| RabbitError::Deserialization(e.to_string()))
    }

    /// Close channel and connection. Outstanding and queued requests fail with
    /// `Closed`.
    pub async fn close(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        if self.send(Command::Close(done)).is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }
}
