//! Application handlers for session notifications
//!
//! Handlers usually run on the transport's callback thread. An outcome that
//! arrives before the submitting call has finished is delivered on the
//! caller's thread instead, so `on_connect` may run inside `connect()`
//! itself. Handlers receive the [`MqttClient`] so follow-up requests
//! (subscribe after connect, for example) can be issued directly from a
//! callback. Handlers must not block for long; hand work off through
//! [`EventChannel`] when it is heavy.

use super::client::MqttClient;
use super::pending::OperationId;
use crate::protocol::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Receiver of asynchronous session notifications.
///
/// Every `connect()` accepted by the transport ends in exactly one of
/// `on_connect` or `on_connect_failure`. A connect attempt closed by
/// `disconnect()` fails with the reason `"disconnected"`.
///
/// Methods run on whichever thread settles the operation. That is normally
/// the transport's, but a request that completes before its submitting call
/// returns is reported on the caller's thread from within that call. Do not
/// hold locks across a request that a handler also takes.
pub trait SessionHandler: Send + Sync {
    fn on_connect(&self, _client: &MqttClient) {}

    fn on_connect_failure(&self, _client: &MqttClient, _reason: &str) {}

    fn on_disconnect(&self, _client: &MqttClient) {}

    fn on_connection_lost(&self, _client: &MqttClient, _cause: &str) {}

    fn on_message(&self, client: &MqttClient, message: Message);

    fn on_subscribe(&self, _client: &MqttClient, _operation: OperationId) {}

    fn on_subscribe_failure(&self, _client: &MqttClient, _operation: OperationId, _reason: &str) {
    }

    fn on_publish(&self, _client: &MqttClient, _operation: OperationId) {}

    fn on_publish_failure(&self, _client: &MqttClient, _operation: OperationId, _reason: &str) {}
}

impl<H: SessionHandler + ?Sized> SessionHandler for Arc<H> {
    fn on_connect(&self, client: &MqttClient) {
        (**self).on_connect(client)
    }

    fn on_connect_failure(&self, client: &MqttClient, reason: &str) {
        (**self).on_connect_failure(client, reason)
    }

    fn on_disconnect(&self, client: &MqttClient) {
        (**self).on_disconnect(client)
    }

    fn on_connection_lost(&self, client: &MqttClient, cause: &str) {
        (**self).on_connection_lost(client, cause)
    }

    fn on_message(&self, client: &MqttClient, message: Message) {
        (**self).on_message(client, message)
    }

    fn on_subscribe(&self, client: &MqttClient, operation: OperationId) {
        (**self).on_subscribe(client, operation)
    }

    fn on_subscribe_failure(&self, client: &MqttClient, operation: OperationId, reason: &str) {
        (**self).on_subscribe_failure(client, operation, reason)
    }

    fn on_publish(&self, client: &MqttClient, operation: OperationId) {
        (**self).on_publish(client, operation)
    }

    fn on_publish_failure(&self, client: &MqttClient, operation: OperationId, reason: &str) {
        (**self).on_publish_failure(client, operation, reason)
    }
}

/// Session notifications as plain values
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    ConnectFailed(String),
    Disconnected,
    ConnectionLost(String),
    Message(Message),
    Subscribed(OperationId),
    SubscribeFailed(OperationId, String),
    Published(OperationId),
    PublishFailed(OperationId, String),
}

/// Handler that forwards every notification into an unbounded channel
#[derive(Debug, Clone)]
pub struct EventChannel {
    sender: mpsc::UnboundedSender<SessionEvent>,
}

impl EventChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn forward(&self, event: SessionEvent) {
        if self.sender.send(event).is_err() {
            debug!("Session event receiver dropped - event discarded");
        }
    }
}

impl SessionHandler for EventChannel {
    fn on_connect(&self, _client: &MqttClient) {
        self.forward(SessionEvent::Connected);
    }

    fn on_connect_failure(&self, _client: &MqttClient, reason: &str) {
        self.forward(SessionEvent::ConnectFailed(reason.to_string()));
    }

    fn on_disconnect(&self, _client: &MqttClient) {
        self.forward(SessionEvent::Disconnected);
    }

    fn on_connection_lost(&self, _client: &MqttClient, cause: &str) {
        self.forward(SessionEvent::ConnectionLost(cause.to_string()));
    }

    fn on_message(&self, _client: &MqttClient, message: Message) {
        self.forward(SessionEvent::Message(message));
    }

    fn on_subscribe(&self, _client: &MqttClient, operation: OperationId) {
        self.forward(SessionEvent::Subscribed(operation));
    }

    fn on_subscribe_failure(&self, _client: &MqttClient, operation: OperationId, reason: &str) {
        self.forward(SessionEvent::SubscribeFailed(operation, reason.to_string()));
    }

    fn on_publish(&self, _client: &MqttClient, operation: OperationId) {
        self.forward(SessionEvent::Published(operation));
    }

    fn on_publish_failure(&self, _client: &MqttClient, operation: OperationId, reason: &str) {
        self.forward(SessionEvent::PublishFailed(operation, reason.to_string()));
    }
}

type ClientHook = Box<dyn Fn(&MqttClient) + Send + Sync>;
type ReasonHook = Box<dyn Fn(&MqttClient, &str) + Send + Sync>;
type MessageHook = Box<dyn Fn(&MqttClient, Message) + Send + Sync>;
type OperationHook = Box<dyn Fn(&MqttClient, OperationId) + Send + Sync>;
type OperationFailureHook = Box<dyn Fn(&MqttClient, OperationId, &str) + Send + Sync>;

/// Closure-based handler.
///
/// ```rust
/// use mqtt_session::session::Callbacks;
/// use mqtt_session::protocol::QoS;
///
/// let callbacks = Callbacks::new()
///     .on_connect(|client| {
///         if let Err(e) = client.subscribe("/temp/shimane", QoS::AtMostOnce) {
///             eprintln!("subscribe rejected: {e}");
///         }
///     })
///     .on_message(|_, message| println!("{}: {:?}", message.topic(), message.payload()));
/// ```
#[derive(Default)]
pub struct Callbacks {
    on_connect: Option<ClientHook>,
    on_connect_failure: Option<ReasonHook>,
    on_disconnect: Option<ClientHook>,
    on_connection_lost: Option<ReasonHook>,
    on_message: Option<MessageHook>,
    on_subscribe: Option<OperationHook>,
    on_subscribe_failure: Option<OperationFailureHook>,
    on_publish: Option<OperationHook>,
    on_publish_failure: Option<OperationFailureHook>,
    reconnect: Option<Reconnect>,
}

/// Delay and runtime for automatic reconnects
struct Reconnect {
    interval: Duration,
    runtime: Option<Handle>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MqttClient) + Send + Sync + 'static,
    {
        self.on_connect = Some(Box::new(hook));
        self
    }

    pub fn on_connect_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MqttClient, &str) + Send + Sync + 'static,
    {
        self.on_connect_failure = Some(Box::new(hook));
        self
    }

    pub fn on_disconnect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MqttClient) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Box::new(hook));
        self
    }

    pub fn on_connection_lost<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MqttClient, &str) + Send + Sync + 'static,
    {
        self.on_connection_lost = Some(Box::new(hook));
        self
    }

    pub fn on_message<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MqttClient, Message) + Send + Sync + 'static,
    {
        self.on_message = Some(Box::new(hook));
        self
    }

    pub fn on_subscribe<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MqttClient, OperationId) + Send + Sync + 'static,
    {
        self.on_subscribe = Some(Box::new(hook));
        self
    }

    pub fn on_subscribe_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MqttClient, OperationId, &str) + Send + Sync + 'static,
    {
        self.on_subscribe_failure = Some(Box::new(hook));
        self
    }

    pub fn on_publish<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MqttClient, OperationId) + Send + Sync + 'static,
    {
        self.on_publish = Some(Box::new(hook));
        self
    }

    pub fn on_publish_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MqttClient, OperationId, &str) + Send + Sync + 'static,
    {
        self.on_publish_failure = Some(Box::new(hook));
        self
    }

    /// Reconnect after `interval` when a connection is lost or a connect
    /// attempt fails and no closure is registered for that notification.
    ///
    /// Reconnects run on the tokio runtime current at this call, falling
    /// back to the one current at the failure. Sessions closed through
    /// `disconnect()` are never reconnected.
    pub fn reconnect_after(mut self, interval: Duration) -> Self {
        self.reconnect = Some(Reconnect {
            interval,
            runtime: Handle::try_current().ok(),
        });
        self
    }

    /// Schedule a reconnect off the callback thread
    fn schedule_reconnect(&self, client: &MqttClient) {
        let Some(reconnect) = &self.reconnect else {
            return;
        };
        if client.disconnect_requested() {
            debug!("Session closed on request - not reconnecting");
            return;
        }

        let Some(runtime) = reconnect
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
        else {
            error!("No tokio runtime available - reconnect skipped");
            return;
        };

        let interval = reconnect.interval;
        let client = client.clone();
        info!("Reconnecting in {:?}", interval);
        runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            if let Err(e) = client.connect() {
                error!("Reconnect attempt rejected: {}", e);
            }
        });
    }
}

impl SessionHandler for Callbacks {
    fn on_connect(&self, client: &MqttClient) {
        if let Some(hook) = &self.on_connect {
            hook(client);
        }
    }

    fn on_connect_failure(&self, client: &MqttClient, reason: &str) {
        match &self.on_connect_failure {
            Some(hook) => hook(client, reason),
            None => {
                warn!("Connect failed: {}", reason);
                self.schedule_reconnect(client);
            }
        }
    }

    fn on_disconnect(&self, client: &MqttClient) {
        if let Some(hook) = &self.on_disconnect {
            hook(client);
        }
    }

    fn on_connection_lost(&self, client: &MqttClient, cause: &str) {
        match &self.on_connection_lost {
            Some(hook) => hook(client, cause),
            None => {
                warn!("Connection lost: {}", cause);
                self.schedule_reconnect(client);
            }
        }
    }

    fn on_message(&self, client: &MqttClient, message: Message) {
        debug!(
            topic = %message.topic(),
            bytes = message.len(),
            "Message received"
        );
        if let Some(hook) = &self.on_message {
            hook(client, message);
        }
    }

    fn on_subscribe(&self, client: &MqttClient, operation: OperationId) {
        if let Some(hook) = &self.on_subscribe {
            hook(client, operation);
        }
    }

    fn on_subscribe_failure(&self, client: &MqttClient, operation: OperationId, reason: &str) {
        if let Some(hook) = &self.on_subscribe_failure {
            hook(client, operation, reason);
        }
    }

    fn on_publish(&self, client: &MqttClient, operation: OperationId) {
        if let Some(hook) = &self.on_publish {
            hook(client, operation);
        }
    }

    fn on_publish_failure(&self, client: &MqttClient, operation: OperationId, reason: &str) {
        if let Some(hook) = &self.on_publish_failure {
            hook(client, operation, reason);
        }
    }
}
