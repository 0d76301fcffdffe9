//! Application-facing MQTT session client
//!
//! Every request method returns as soon as the transport accepted the
//! request. The returned [`OperationToken`] (or the [`SessionHandler`])
//! observes the outcome.

use super::handler::SessionHandler;
use super::pending::{OperationKind, OperationToken};
use super::router::CallbackRouter;
use super::state::ConnectionState;
use crate::config::{ConfigError, ConnectionConfig};
use crate::error::{ClientError, ClientResult};
use crate::protocol::{validate_publish_topic, validate_topic_filter, QoS};
use crate::transport::{
    Completion, ConnectOptions, MqttTransport, Transport, TransportError, TransportHandle,
};
use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub(crate) struct ClientInner {
    config: RwLock<Option<ConnectionConfig>>,
    transport: Arc<dyn Transport>,
    handle: Mutex<Option<Box<dyn TransportHandle>>>,
    router: Arc<CallbackRouter>,
}

impl ClientInner {
    fn lock_handle(&self) -> MutexGuard<'_, Option<Box<dyn TransportHandle>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let handle = self
            .handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            debug!("Destroying transport handle of dropped client");
            handle.destroy();
        }
    }
}

/// A single logical broker connection.
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct MqttClient {
    inner: Arc<ClientInner>,
}

impl MqttClient {
    /// Create an unconfigured client on top of `transport`
    pub fn new<H>(transport: Arc<dyn Transport>, handler: H) -> Self
    where
        H: SessionHandler + 'static,
    {
        let handler: Arc<dyn SessionHandler> = Arc::new(handler);
        let inner = Arc::new_cyclic(|weak| ClientInner {
            config: RwLock::new(None),
            transport,
            handle: Mutex::new(None),
            router: Arc::new(CallbackRouter::new(handler, weak.clone())),
        });
        Self { inner }
    }

    /// Create a client backed by rumqttc on the current tokio runtime
    pub fn with_rumqttc<H>(handler: H) -> ClientResult<Self>
    where
        H: SessionHandler + 'static,
    {
        let transport = MqttTransport::from_current().map_err(ClientError::ConnectionFailure)?;
        Ok(Self::new(Arc::new(transport), handler))
    }

    /// Create and configure a client in one step
    pub fn connect_to<H>(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
        handler: H,
    ) -> ClientResult<Self>
    where
        H: SessionHandler + 'static,
    {
        let client = Self::new(transport, handler);
        client.configure(config)?;
        Ok(client)
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    /// Store connection settings; never touches the network.
    ///
    /// Rejected while a session is live so settings such as the clean-session
    /// flag cannot change underneath an open connection.
    pub fn configure(&self, config: ConnectionConfig) -> ClientResult<()> {
        config.validate()?;

        let state = self.state();
        if state.is_live() {
            return Err(ClientError::configuration(format!(
                "cannot reconfigure while {state}"
            )));
        }

        debug!(
            address = %config.address,
            client_id = %config.client_id,
            keep_alive_secs = config.keep_alive_secs,
            request_timeout_ms = config.request_timeout_ms,
            "Client configured"
        );
        *self
            .inner
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(config);
        Ok(())
    }

    /// Current connection settings
    pub fn config(&self) -> Option<ConnectionConfig> {
        self.inner
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start the broker handshake.
    ///
    /// Returns once the transport accepted the request; the token resolves
    /// when the handshake succeeds or fails. A handshake that finishes first
    /// is reported from within this call, on the caller's thread. Rejected
    /// with [`ClientError::AlreadyConnected`] unless the session is
    /// Disconnected.
    pub fn connect(&self) -> ClientResult<OperationToken> {
        let config = self
            .config()
            .ok_or_else(|| ClientError::configuration("client is not configured"))?;
        config.validate()?;

        let (token, generation) = self
            .inner
            .router
            .begin_session()
            .map_err(|state| ClientError::AlreadyConnected { state })?;

        let span = crate::session_span!("connect", client_id = %config.client_id, generation);
        let _enter = span.enter();

        let options = ConnectOptions {
            keep_alive: config.keep_alive(),
            clean_session: config.clean_session,
            request_timeout: config.request_timeout(),
            credentials: config.credentials(),
            max_packet_size: config.max_packet_size,
        };

        let submitted = {
            let mut slot = self.inner.lock_handle();
            if let Some(previous) = slot.take() {
                debug!("Releasing transport handle of previous session");
                previous.destroy();
            }

            self.inner
                .transport
                .create(&config.address, &config.client_id, config.persistence)
                .and_then(|mut handle| {
                    handle.set_callbacks(self.inner.router.callbacks(generation));
                    let completion = self.inner.router.completion(token.id());
                    match handle.connect(&options, completion) {
                        Ok(()) => {
                            *slot = Some(handle);
                            Ok(())
                        }
                        Err(e) => {
                            handle.destroy();
                            Err(e)
                        }
                    }
                })
        };

        match submitted {
            Ok(()) => {
                info!(address = %config.address, "Connecting to MQTT broker");
                self.inner.router.submitted(token.id());
                Ok(token)
            }
            Err(e) => {
                warn!(error = %e, "Transport refused connect request");
                self.inner.router.forget(token.id());
                self.inner.router.abort_session(generation, &e.to_string());
                Err(ClientError::ConnectionFailure(e))
            }
        }
    }

    /// Request a clean disconnect.
    ///
    /// Moves to Disconnecting immediately and to Disconnected once the
    /// transport confirms.
    pub fn disconnect(&self) -> ClientResult<OperationToken> {
        let mut slot = self.inner.lock_handle();
        let handle = match slot.as_mut() {
            Some(handle) if self.state().is_live() => handle,
            _ => return Err(ClientError::NullClient),
        };

        let (token, previous) = self.inner.router.begin_disconnect().map_err(|state| {
            ClientError::DisconnectFailure(TransportError::Rejected(format!(
                "disconnect already in progress ({state})"
            )))
        })?;

        let completion = self.inner.router.completion(token.id());
        let result = handle.disconnect(completion);
        drop(slot);

        match result {
            Ok(()) => {
                info!("Disconnecting from MQTT broker");
                self.inner.router.submitted(token.id());
                Ok(token)
            }
            Err(e) => {
                warn!(error = %e, "Transport refused disconnect request");
                self.inner.router.cancel_disconnect(token.id(), previous);
                Err(ClientError::DisconnectFailure(e))
            }
        }
    }

    /// Publish `payload` to `topic`.
    ///
    /// The payload length is carried explicitly, so binary payloads with
    /// embedded zero bytes arrive intact.
    pub fn publish<P>(
        &self,
        topic: &str,
        payload: P,
        qos: QoS,
        retain: bool,
    ) -> ClientResult<OperationToken>
    where
        P: Into<Bytes>,
    {
        validate_publish_topic(topic).map_err(ConfigError::from)?;
        let payload = payload.into();
        let bytes = payload.len();

        let token = self.submit(OperationKind::Publish, |handle, completion| {
            handle.publish(topic, payload, qos, retain, completion)
        })?;
        debug!(operation = %token.id(), topic, bytes, qos = %qos, retain, "Publish accepted");
        Ok(token)
    }

    /// Subscribe to a topic filter (`+` and `#` wildcards allowed)
    pub fn subscribe(&self, filter: &str, qos: QoS) -> ClientResult<OperationToken> {
        validate_topic_filter(filter).map_err(ConfigError::from)?;

        let token = self.submit(OperationKind::Subscribe, |handle, completion| {
            handle.subscribe(filter, qos, completion)
        })?;
        debug!(operation = %token.id(), filter, qos = %qos, "Subscribe accepted");
        Ok(token)
    }

    /// Publish and wait up to `timeout` for the broker acknowledgement.
    ///
    /// The wait runs on the caller's task, never on the transport's callback
    /// thread. Expiry yields [`ClientError::Timeout`]; the publish itself keeps
    /// running and still notifies the handler.
    pub async fn publish_and_wait<P>(
        &self,
        topic: &str,
        payload: P,
        qos: QoS,
        retain: bool,
        timeout: Duration,
    ) -> ClientResult<()>
    where
        P: Into<Bytes>,
    {
        self.publish(topic, payload, qos, retain)?
            .wait_timeout(timeout)
            .await
    }

    fn submit<F>(&self, kind: OperationKind, request: F) -> ClientResult<OperationToken>
    where
        F: FnOnce(&mut Box<dyn TransportHandle>, Completion) -> Result<(), TransportError>,
    {
        let mut slot = self.inner.lock_handle();
        let handle = slot.as_mut().ok_or(ClientError::NullClient)?;

        let token = self
            .inner
            .router
            .register(kind)
            .map_err(|state| match state {
                ConnectionState::Disconnected => ClientError::NullClient,
                state => ClientError::NotConnected { state },
            })?;

        let completion = self.inner.router.completion(token.id());
        let result = request(handle, completion);
        drop(slot);

        match result {
            Ok(()) => {
                self.inner.router.submitted(token.id());
                Ok(token)
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "Transport refused request");
                self.inner.router.forget(token.id());
                Err(ClientError::rejected(kind, e))
            }
        }
    }

    /// Last-known connectivity, not a live transport query
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.router.state()
    }

    /// True once `disconnect()` was accepted for the current session.
    ///
    /// Lets a handler tell a requested shutdown from a broker-side failure.
    pub fn disconnect_requested(&self) -> bool {
        self.inner.router.disconnect_requested()
    }

    /// Receiver that observes every state transition
    pub fn state_watcher(&self) -> watch::Receiver<ConnectionState> {
        self.inner.router.watch()
    }
}

impl fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let client_id = self.config().map(|config| config.client_id);
        f.debug_struct("MqttClient")
            .field("client_id", &client_id)
            .field("state", &self.state())
            .field("generation", &self.inner.router.generation())
            .finish()
    }
}
