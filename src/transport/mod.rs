//! Transport Adapter seam
//!
//! The session core never speaks the MQTT wire protocol itself. It drives an
//! underlying engine through the narrow surface defined here: create a
//! handle, register connection-lost/message-arrived callbacks, and submit
//! connect, disconnect, publish and subscribe requests that each complete
//! through a one-shot [`Completion`].
//!
//! Contract for implementors:
//! - Submission methods never block on network I/O and never resolve a
//!   completion on the calling thread. Other threads may resolve it before
//!   the submitting call returns.
//! - Every accepted request resolves its [`Completion`] exactly once. A
//!   completion that is dropped unresolved reports a failure on its own;
//!   for a rejected request the session discards that report.
//! - `message_arrived` borrows transport buffers only for the duration of
//!   the call.

use crate::config::Persistence;
use crate::protocol::QoS;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;

/// Synchronous rejection of a request by the transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("request queue is full")]
    QueueFull,
    #[error("transport is closed")]
    Closed,
    #[error("transport is not connected")]
    NotConnected,
    #[error("no async runtime available: {0}")]
    NoRuntime(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Options handed to the transport for the handshake
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// Upper bound for the handshake before it is reported as failed
    pub request_timeout: Duration,
    pub credentials: Option<(String, String)>,
    pub max_packet_size: usize,
}

type SuccessFn = Box<dyn FnOnce() + Send>;
type FailureFn = Box<dyn FnOnce(String) + Send>;

/// One-shot success/failure continuation for a submitted request
pub struct Completion {
    continuations: Option<(SuccessFn, FailureFn)>,
}

impl Completion {
    pub fn new<S, F>(on_success: S, on_failure: F) -> Self
    where
        S: FnOnce() + Send + 'static,
        F: FnOnce(String) + Send + 'static,
    {
        Self {
            continuations: Some((Box::new(on_success), Box::new(on_failure))),
        }
    }

    /// A completion nobody is waiting on
    pub fn detached() -> Self {
        Self::new(|| {}, |_| {})
    }

    pub fn succeed(mut self) {
        if let Some((on_success, _)) = self.continuations.take() {
            on_success();
        }
    }

    pub fn fail<S: Into<String>>(mut self, reason: S) {
        if let Some((_, on_failure)) = self.continuations.take() {
            on_failure(reason.into());
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some((_, on_failure)) = self.continuations.take() {
            on_failure("request dropped by transport".to_string());
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("resolved", &self.continuations.is_none())
            .finish()
    }
}

/// Unsolicited notifications from a live transport handle
pub trait TransportCallbacks: Send + Sync {
    /// The link broke after the handshake completed
    fn connection_lost(&self, cause: &str);

    /// The broker delivered a message on a subscribed topic
    fn message_arrived(&self, topic: &str, payload: &[u8]);
}

/// A single broker connection owned by one session
pub trait TransportHandle: Send {
    fn set_callbacks(&mut self, callbacks: Arc<dyn TransportCallbacks>);

    fn connect(
        &mut self,
        options: &ConnectOptions,
        completion: Completion,
    ) -> Result<(), TransportError>;

    fn disconnect(&mut self, completion: Completion) -> Result<(), TransportError>;

    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        completion: Completion,
    ) -> Result<(), TransportError>;

    fn subscribe(
        &mut self,
        filter: &str,
        qos: QoS,
        completion: Completion,
    ) -> Result<(), TransportError>;

    /// Release the handle; must not block and must not wait on callbacks
    fn destroy(self: Box<Self>);
}

/// Factory for transport handles
pub trait Transport: Send + Sync {
    fn create(
        &self,
        address: &str,
        client_id: &str,
        persistence: Persistence,
    ) -> Result<Box<dyn TransportHandle>, TransportError>;
}

/// Type alias for the rumqttc-backed transport
pub type MqttTransport = mqtt::RumqttcAdapter;
