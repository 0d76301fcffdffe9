//! rumqttc-backed Transport Adapter
//!
//! Each handle owns one rumqttc [`AsyncClient`] and drives its event loop on
//! a tokio task. Requests are queued with the non-blocking `try_*` calls;
//! their completions resolve from the event loop task as packets flow.

use super::event_route::{route_event, EventRoute, InflightTracker};
use super::options::{build_mqtt_options, to_rumqttc_qos};
use crate::config::{BrokerAddress, Persistence};
use crate::protocol::QoS;
use crate::transport::{
    Completion, ConnectOptions, Transport, TransportCallbacks, TransportError, TransportHandle,
};
use bytes::Bytes;
use rumqttc::{AsyncClient, ClientError as RumqttcClientError, EventLoop};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the rumqttc request channel
pub const DEFAULT_REQUEST_CAPACITY: usize = 64;

/// Factory for rumqttc handles bound to a tokio runtime
#[derive(Debug, Clone)]
pub struct RumqttcAdapter {
    runtime: Handle,
    request_capacity: usize,
}

impl RumqttcAdapter {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            request_capacity: DEFAULT_REQUEST_CAPACITY,
        }
    }

    /// Bind to the runtime of the calling context
    pub fn from_current() -> Result<Self, TransportError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| TransportError::NoRuntime(e.to_string()))
    }

    pub fn with_request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = capacity.max(1);
        self
    }
}

impl Transport for RumqttcAdapter {
    fn create(
        &self,
        address: &str,
        client_id: &str,
        persistence: Persistence,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let address = BrokerAddress::parse(address)
            .map_err(|e| TransportError::InvalidAddress(e.to_string()))?;
        if client_id.is_empty() {
            return Err(TransportError::Rejected(
                "client id must not be empty".to_string(),
            ));
        }

        debug!(
            host = %address.host,
            port = address.port,
            tls = address.tls,
            ?persistence,
            "Created rumqttc handle"
        );
        Ok(Box::new(RumqttcHandle {
            address,
            client_id: client_id.to_string(),
            runtime: self.runtime.clone(),
            request_capacity: self.request_capacity,
            callbacks: None,
            client: None,
            tracker: Arc::new(Mutex::new(InflightTracker::default())),
            task: None,
        }))
    }
}

type SharedTracker = Arc<Mutex<InflightTracker>>;

fn lock_tracker(tracker: &SharedTracker) -> MutexGuard<'_, InflightTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One broker connection driven by rumqttc
pub struct RumqttcHandle {
    address: BrokerAddress,
    client_id: String,
    runtime: Handle,
    request_capacity: usize,
    callbacks: Option<Arc<dyn TransportCallbacks>>,
    client: Option<AsyncClient>,
    tracker: SharedTracker,
    task: Option<JoinHandle<()>>,
}

impl RumqttcHandle {
    /// The client, provided the event loop is still running
    fn live_client(&self) -> Result<&AsyncClient, TransportError> {
        match (&self.client, &self.task) {
            (Some(_), Some(task)) if task.is_finished() => Err(TransportError::Closed),
            (Some(client), Some(_)) => Ok(client),
            _ => Err(TransportError::NotConnected),
        }
    }
}

fn map_client_error(error: RumqttcClientError) -> TransportError {
    match error {
        RumqttcClientError::TryRequest(_) => TransportError::QueueFull,
        _ => TransportError::Closed,
    }
}

impl TransportHandle for RumqttcHandle {
    fn set_callbacks(&mut self, callbacks: Arc<dyn TransportCallbacks>) {
        self.callbacks = Some(callbacks);
    }

    fn connect(
        &mut self,
        options: &ConnectOptions,
        completion: Completion,
    ) -> Result<(), TransportError> {
        if self.task.is_some() {
            return Err(TransportError::Rejected(
                "handle already connected".to_string(),
            ));
        }
        let callbacks = self.callbacks.clone().ok_or_else(|| {
            TransportError::Rejected("callbacks must be set before connecting".to_string())
        })?;

        let mqtt_options = build_mqtt_options(&self.address, &self.client_id, options);
        let (client, event_loop) = AsyncClient::new(mqtt_options, self.request_capacity);

        let task = self.runtime.spawn(run_event_loop(
            event_loop,
            Arc::clone(&self.tracker),
            callbacks,
            completion,
            options.request_timeout,
        ));

        self.client = Some(client);
        self.task = Some(task);
        Ok(())
    }

    fn disconnect(&mut self, completion: Completion) -> Result<(), TransportError> {
        let client = self.live_client()?;
        let mut tracker = lock_tracker(&self.tracker);
        if tracker.disconnect_requested() {
            return Err(TransportError::Rejected(
                "disconnect already requested".to_string(),
            ));
        }
        client.try_disconnect().map_err(map_client_error)?;
        tracker.queue_disconnect(completion);
        Ok(())
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        completion: Completion,
    ) -> Result<(), TransportError> {
        let client = self.live_client()?;
        let mut tracker = lock_tracker(&self.tracker);
        client
            .try_publish(topic, to_rumqttc_qos(qos), retain, payload.to_vec())
            .map_err(map_client_error)?;
        tracker.queue_publish(qos, completion);
        Ok(())
    }

    fn subscribe(
        &mut self,
        filter: &str,
        qos: QoS,
        completion: Completion,
    ) -> Result<(), TransportError> {
        let client = self.live_client()?;
        let mut tracker = lock_tracker(&self.tracker);
        client
            .try_subscribe(filter, to_rumqttc_qos(qos))
            .map_err(map_client_error)?;
        tracker.queue_subscribe(completion);
        Ok(())
    }

    fn destroy(self: Box<Self>) {
        drop(self);
    }
}

impl Drop for RumqttcHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Resolve completions outside the tracker lock
fn resolve_all(resolved: Vec<(Completion, Result<(), String>)>) {
    for (completion, outcome) in resolved {
        match outcome {
            Ok(()) => completion.succeed(),
            Err(reason) => completion.fail(reason),
        }
    }
}

/// Poll until the broker answers the handshake
async fn await_connack(event_loop: &mut EventLoop) -> Result<(), String> {
    loop {
        let event = event_loop.poll().await.map_err(|e| e.to_string())?;
        match route_event(&event) {
            EventRoute::ConnectionAcknowledged { accepted: true, .. } => return Ok(()),
            EventRoute::ConnectionAcknowledged {
                accepted: false,
                detail,
            } => return Err(format!("connection refused: {detail}")),
            other => debug!(?other, "Event before ConnAck"),
        }
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    tracker: SharedTracker,
    callbacks: Arc<dyn TransportCallbacks>,
    connect: Completion,
    request_timeout: Duration,
) {
    match tokio::time::timeout(request_timeout, await_connack(&mut event_loop)).await {
        Ok(Ok(())) => {
            info!("ConnAck received");
            connect.succeed();
        }
        Ok(Err(reason)) => {
            warn!(%reason, "MQTT handshake failed");
            connect.fail(reason);
            resolve_failed(&tracker, "connection failed");
            return;
        }
        Err(_) => {
            warn!(?request_timeout, "MQTT handshake timed out");
            connect.fail(format!("connect timed out after {request_timeout:?}"));
            resolve_failed(&tracker, "connection failed");
            return;
        }
    }

    let cause = loop {
        match event_loop.poll().await {
            Ok(event) => {
                let route = route_event(&event);
                match &route {
                    EventRoute::MessageReceived { topic, payload } => {
                        callbacks.message_arrived(topic, payload);
                    }
                    EventRoute::Disconnected => break "broker closed the session".to_string(),
                    EventRoute::InfrastructureEvent(detail) => {
                        trace!(target: "mqtt_transport", "MQTT event: {}", detail);
                    }
                    _ => {}
                }

                let resolved = lock_tracker(&tracker).advance(&route);
                resolve_all(resolved);

                if route == EventRoute::DisconnectSent {
                    info!("MQTT disconnect sent");
                    resolve_failed(&tracker, "disconnected");
                    return;
                }
            }
            Err(e) => {
                let disconnect = lock_tracker(&tracker).take_disconnect();
                if let Some(completion) = disconnect {
                    // The broker closed the socket first; the session is down either way.
                    debug!(error = %e, "Event loop closed during disconnect");
                    completion.succeed();
                    resolve_failed(&tracker, "disconnected");
                    return;
                }
                error!(error = %e, "MQTT event loop error");
                break e.to_string();
            }
        }
    };

    callbacks.connection_lost(&cause);
    resolve_failed(&tracker, &cause);
}

fn resolve_failed(tracker: &SharedTracker, reason: &str) {
    let pending = lock_tracker(tracker).drain();
    for completion in pending {
        completion.fail(reason);
    }
}
