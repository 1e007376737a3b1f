// src/messaging/mod.rs
// RPC reply handling: envelope classification, pending-call bookkeeping and
// the reply queue listener.

pub mod envelope;
pub mod registry;
pub mod reply_listener;

pub use envelope::{classify, Outcome, ReplyEnvelope};
pub use registry::{CorrelationRegistry, PendingCall};
