// src/rabbitmq/connection.rs
// Connection state machine. A single task owns the broker channel and works
// through client commands in arrival order; while the channel is down commands
// wait in the queue instead of failing.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::consumer::{self, SubscribeRequest, Subscription};
use super::errors::{RabbitError, Result};
use super::publisher::{self, PublishRequest};
use super::request_response::{self, RpcRequest};
use super::transport::{
    ConsumeOptions, Connector, QueueOptions, TransportChannel, TransportConnection,
};
use crate::config::ClientConfig;
use crate::messaging::registry::CorrelationRegistry;
use crate::messaging::reply_listener::spawn_reply_listener;

/// Outcome of handing one request to the channel: on failure the request comes
/// back untouched so it can be retried or failed.
pub(crate) type Dispatch<T> = std::result::Result<(), (RabbitError, T)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// First connection attempt cycle.
    Connecting,
    Ready,
    /// Connection was lost; `attempt` is the attempt in progress.
    Reconnecting { attempt: u32 },
    /// Retry budget exhausted. Terminal.
    Failed { attempts: u32 },
    Closed,
}

pub(crate) enum Command {
    Publish(PublishRequest),
    Rpc(RpcRequest),
    Subscribe(SubscribeRequest),
    Close(oneshot::Sender<()>),
}

impl Command {
    /// Mark as retried, returning whether it already was.
    fn mark_retried(&mut self) -> bool {
        let retried = match self {
            Command::Publish(request) => &mut request.retried,
            Command::Rpc(request) => &mut request.retried,
            Command::Subscribe(request) => &mut request.retried,
            Command::Close(_) => return true,
        };
        std::mem::replace(retried, true)
    }

    fn fail(self, error: RabbitError) {
        match self {
            Command::Publish(request) => {
                let _ = request.done.send(Err(error));
            }
            Command::Rpc(request) => {
                let _ = request.responder.send(Err(error));
            }
            Command::Subscribe(request) => {
                let _ = request.done.send(Err(error));
            }
            Command::Close(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// A live connection with its reply queue subscription.
struct Session {
    connection: Arc<dyn TransportConnection>,
    channel: Arc<dyn TransportChannel>,
    reply_queue: String,
    reply_listener: JoinHandle<()>,
    consumers: Vec<JoinHandle<()>>,
}

impl Session {
    fn stop_tasks(&self) {
        self.reply_listener.abort();
        for consumer in &self.consumers {
            consumer.abort();
        }
    }

    async fn teardown(self) {
        self.stop_tasks();
        let _ = self.channel.close().await;
        let _ = self.connection.close().await;
    }

    async fn close(self) {
        self.stop_tasks();
        if let Err(e) = self.channel.close().await {
            warn!(error = %e, "Failed to close channel");
        }
        if let Err(e) = self.connection.close().await {
            warn!(error = %e, "Failed to close connection");
        }
    }
}

async fn open_session(
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    registry: CorrelationRegistry,
    subscriptions: Vec<Subscription>,
) -> Result<Session> {
    let connection = connector.connect(&config.url).await?;

    let setup = async {
        let channel = connection.create_channel().await?;
        channel
            .assert_exchange(&config.exchange, config.exchange_kind)
            .await?;

        let reply_queue = channel
            .assert_queue(
                "",
                QueueOptions {
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                },
            )
            .await?;
        channel
            .bind_queue(&reply_queue, &config.exchange, &reply_queue)
            .await?;
        let replies = channel
            .consume(
                &reply_queue,
                ConsumeOptions {
                    no_ack: true,
                    exclusive: true,
                    ..ConsumeOptions::default()
                },
            )
            .await?;
        let reply_listener = spawn_reply_listener(replies, registry);
        debug!(reply_queue = %reply_queue, "Reply listener subscribed");

        let mut consumers = Vec::with_capacity(subscriptions.len());
        for subscription in &subscriptions {
            match consumer::subscribe(channel.clone(), &config.exchange, subscription).await {
                Ok(handle) => consumers.push(handle),
                Err(e) => {
                    reply_listener.abort();
                    consumers.iter().for_each(JoinHandle::abort);
                    return Err(e);
                }
            }
        }
        Ok::<_, RabbitError>((channel, reply_queue, reply_listener, consumers))
    };

    match setup.await {
        Ok((channel, reply_queue, reply_listener, consumers)) => Ok(Session {
            connection,
            channel,
            reply_queue,
            reply_listener,
            consumers,
        }),
        Err(e) => {
            let _ = connection.close().await;
            Err(e)
        }
    }
}

enum Halt {
    Closed(Option<oneshot::Sender<()>>),
    Exhausted(u32),
}

enum SessionEnd {
    Lost,
    Closed(Option<oneshot::Sender<()>>),
}

pub(crate) struct Dispatcher {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    registry: CorrelationRegistry,
    commands: mpsc::UnboundedReceiver<Command>,
    deferred: VecDeque<Command>,
    subscriptions: Vec<Subscription>,
    state: watch::Sender<ConnectionState>,
}

impl Dispatcher {
    /// Start the connection task. Must be called inside a tokio runtime.
    pub(crate) fn spawn(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        registry: CorrelationRegistry,
    ) -> (
        mpsc::UnboundedSender<Command>,
        watch::Receiver<ConnectionState>,
    ) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(ConnectionState::Connecting);
        let dispatcher = Dispatcher {
            config,
            connector,
            registry,
            commands,
            deferred: VecDeque::new(),
            subscriptions: Vec::new(),
            state,
        };
        tokio::spawn(dispatcher.run());
        (commands_tx, state_rx)
    }

    async fn run(mut self) {
        let mut reconnecting = false;
        loop {
            let mut session = match self.establish(reconnecting).await {
                Ok(session) => session,
                Err(Halt::Closed(done)) => {
                    self.shutdown(None, done).await;
                    return;
                }
                Err(Halt::Exhausted(attempts)) => {
                    self.fail_forever(attempts).await;
                    return;
                }
            };

            match self.serve(&mut session).await {
                SessionEnd::Lost => {
                    session.teardown().await;
                    reconnecting = true;
                }
                SessionEnd::Closed(done) => {
                    self.shutdown(Some(session), done).await;
                    return;
                }
            }
        }
    }

    /// Queue a command that arrived while the channel is unavailable.
    fn defer(&mut self, command: Option<Command>) -> Option<Halt> {
        match command {
            Some(Command::Close(done)) => Some(Halt::Closed(Some(done))),
            Some(command) => {
                self.deferred.push_back(command);
                None
            }
            None => Some(Halt::Closed(None)),
        }
    }

    async fn establish(&mut self, reconnecting: bool) -> std::result::Result<Session, Halt> {
        let policy = self.config.reconnect.clone();
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.state.send_replace(if reconnecting {
                ConnectionState::Reconnecting { attempt }
            } else {
                ConnectionState::Connecting
            });

            let open = open_session(
                self.connector.clone(),
                self.config.clone(),
                self.registry.clone(),
                self.subscriptions.clone(),
            );
            tokio::pin!(open);

            let result = loop {
                tokio::select! {
                    result = &mut open => break result,
                    command = self.commands.recv() => {
                        if let Some(halt) = self.defer(command) {
                            return Err(halt);
                        }
                    }
                }
            };

            match result {
                Ok(session) => {
                    info!(
                        reply_queue = %session.reply_queue,
                        attempt,
                        "Connected to RabbitMQ"
                    );
                    self.state.send_replace(ConnectionState::Ready);
                    return Ok(session);
                }
                Err(e) => {
                    error!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "Failed to connect to RabbitMQ"
                    );
                    if attempt >= policy.max_attempts {
                        error!("Max reconnection attempts reached. Giving up.");
                        return Err(Halt::Exhausted(attempt));
                    }
                }
            }

            let delay = policy.delay_for(attempt);
            info!("Waiting {}ms before next reconnect attempt", delay.as_millis());
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = self.commands.recv() => {
                        if let Some(halt) = self.defer(command) {
                            return Err(halt);
                        }
                    }
                }
            }
        }
    }

    async fn serve(&mut self, session: &mut Session) -> SessionEnd {
        if !self.deferred.is_empty() {
            debug!(queued = self.deferred.len(), "Flushing commands queued while connecting");
        }
        while let Some(command) = self.deferred.pop_front() {
            if let Some(end) = self.execute(session, command).await {
                return end;
            }
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Some(end) = self.execute(session, command).await {
                            return end;
                        }
                    }
                    None => return SessionEnd::Closed(None),
                },
                _ = &mut session.reply_listener => {
                    warn!("Reply subscription ended, reconnecting");
                    return SessionEnd::Lost;
                }
            }
        }
    }

    async fn execute(&mut self, session: &mut Session, command: Command) -> Option<SessionEnd> {
        let exchange = self.config.exchange.as_str();
        let failure = match command {
            Command::Close(done) => return Some(SessionEnd::Closed(Some(done))),
            Command::Publish(request) => {
                publisher::dispatch(session.channel.as_ref(), exchange, request)
                    .await
                    .err()
                    .map(|(e, request)| (e, Command::Publish(request)))
            }
            Command::Rpc(request) => request_response::dispatch(
                session.channel.as_ref(),
                exchange,
                &session.reply_queue,
                &self.registry,
                request,
            )
            .await
            .err()
            .map(|(e, request)| (e, Command::Rpc(request))),
            Command::Subscribe(request) => {
                match consumer::subscribe(session.channel.clone(), exchange, &request.subscription)
                    .await
                {
                    Ok(handle) => {
                        session.consumers.push(handle);
                        self.subscriptions.push(request.subscription);
                        let _ = request.done.send(Ok(()));
                        None
                    }
                    Err(e) => Some((e, Command::Subscribe(request))),
                }
            }
        };

        let (error, mut command) = failure?;
        if error.is_transport() && !command.mark_retried() {
            warn!(error = %error, "Channel operation failed, re-queueing and reconnecting");
            self.deferred.push_front(command);
            return Some(SessionEnd::Lost);
        }
        command.fail(error);
        None
    }

    async fn shutdown(&mut self, session: Option<Session>, done: Option<oneshot::Sender<()>>) {
        self.state.send_replace(ConnectionState::Closed);
        if let Some(session) = session {
            session.close().await;
        }

        self.commands.close();
        while let Some(command) = self.deferred.pop_front() {
            command.fail(RabbitError::Closed);
        }
        while let Ok(command) = self.commands.try_recv() {
            command.fail(RabbitError::Closed);
        }
        let rejected = self.registry.reject_all(|| RabbitError::Closed);

        info!(rejected, "RabbitMQ client closed");
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    /// Terminal state: the channel will never come back, so every waiting and
    /// future request fails right away.
    async fn fail_forever(&mut self, attempts: u32) {
        self.state.send_replace(ConnectionState::Failed { attempts });

        let exhausted = || RabbitError::RetriesExhausted { attempts };
        while let Some(command) = self.deferred.pop_front() {
            command.fail(exhausted());
        }
        self.registry.reject_all(exhausted);

        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Close(done) => {
                    self.state.send_replace(ConnectionState::Closed);
                    let _ = done.send(());
                    return;
                }
                command => command.fail(exhausted()),
            }
        }
    }
}
