// src/messaging/registry.rs

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::envelope::{classify, ReplyEnvelope};
use crate::rabbitmq::errors::{RabbitError, Result};

pub type Responder = oneshot::Sender<Result<Value>>;

/// One outstanding RPC call.
///
/// The responder is consumed by whichever terminal event removes the record
/// from the registry, so a call cannot settle twice.
pub struct PendingCall {
    responder: Responder,
    timeout: Duration,
    timer: Option<AbortHandle>,
}

impl PendingCall {
    pub fn new(responder: Responder, timeout: Duration) -> Self {
        Self {
            responder,
            timeout,
            timer: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn settle(self, result: Result<Value>) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.responder.send(result);
    }

    fn into_responder(self) -> Responder {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
        self.responder
    }
}

/// Maps correlation ids to pending calls. An id is present exactly while its
/// call is outstanding; removal under the lock is what decides the winner
/// between a reply and a timeout.
#[derive(Clone, Default)]
pub struct CorrelationRegistry {
    calls: Arc<Mutex<HashMap<String, PendingCall>>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingCall>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take(&self, correlation_id: &str) -> Option<PendingCall> {
        self.lock().remove(correlation_id)
    }

    /// Insert a new pending call. A colliding id leaves the existing entry in
    /// place and settles the new call with `DuplicateCorrelationId`.
    pub fn register(&self, correlation_id: &str, call: PendingCall) -> Result<()> {
        let mut calls = self.lock();
        if calls.contains_key(correlation_id) {
            drop(calls);
            warn!(correlation_id = %correlation_id, "Correlation id collision");
            call.settle(Err(RabbitError::DuplicateCorrelationId(
                correlation_id.to_string(),
            )));
            return Err(RabbitError::DuplicateCorrelationId(correlation_id.to_string()));
        }
        calls.insert(correlation_id.to_string(), call);
        Ok(())
    }

    /// Start the timeout for a registered call. Must run inside a tokio runtime.
    pub fn arm_timeout(&self, correlation_id: &str) {
        let Some(timeout) = self.lock().get(correlation_id).map(PendingCall::timeout) else {
            return;
        };

        let registry = self.clone();
        let id = correlation_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            registry.expire(&id);
        })
        .abort_handle();

        match self.lock().get_mut(correlation_id) {
            Some(call) => call.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Settle a call from its reply. Returns false when no call is waiting,
    /// which covers late replies after a timeout.
    pub fn resolve(&self, correlation_id: &str, envelope: ReplyEnvelope) -> bool {
        match self.take(correlation_id) {
            Some(call) => {
                debug!(correlation_id = %correlation_id, "Reply matched pending call");
                call.settle(classify(envelope).into_result());
                true
            }
            None => false,
        }
    }

    /// Settle a call with a timeout error, unless it already settled.
    pub fn expire(&self, correlation_id: &str) -> bool {
        match self.take(correlation_id) {
            Some(call) => {
                let timeout = call.timeout;
                warn!(
                    correlation_id = %correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "RPC call timed out"
                );
                call.settle(Err(RabbitError::Timeout { timeout }));
                true
            }
            None => false,
        }
    }

    /// Settle a call with an arbitrary error.
    pub fn reject(&self, correlation_id: &str, error: RabbitError) -> bool {
        match self.take(correlation_id) {
            Some(call) => {
                call.settle(Err(error));
                true
            }
            None => false,
        }
    }

    /// Withdraw a call without settling it, handing back its responder.
    pub fn cancel(&self, correlation_id: &str) -> Option<Responder> {
        self.take(correlation_id).map(PendingCall::into_responder)
    }

    /// Settle every outstanding call with the error built by `error`.
    pub fn reject_all(&self, error: impl Fn() -> RabbitError) -> usize {
        let calls: Vec<PendingCall> = self.lock().drain().map(|(_, call)| call).collect();
        let count = calls.len();
        for call in calls {
            call.settle(Err(error()));
        }
        count
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.lock().contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
