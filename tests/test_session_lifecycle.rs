//! Session lifecycle tests against the simulated broker
//!
//! Covers the observable contract of `MqttClient`: every request either fails
//! synchronously or resolves through exactly one terminal notification, and
//! state queried from inside a callback already reflects that callback.


use mqtt_session::config::Persistence;
use mqtt_session::error::ClientError;
use mqtt_session::protocol::QoS;
use mqtt_session::session::{Callbacks, ConnectionState, MqttClient, OperationKind};
use mqtt_session::testing::{ConnectBehavior, SimulatedTransport, TransportCall};
use mqtt_session::transport::{
    Completion, ConnectOptions, Transport, TransportCallbacks, TransportError, TransportHandle,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use test_helpers::{connected_client, eventually, simulated_client, test_config, Recorded};

#[tokio::test]
async fn test_connect_subscribe_publish_disconnect() {
    let (client, transport, handler) = simulated_client("c1");
    assert_eq!(client.state(), ConnectionState::Disconnected);

    client.connect().unwrap().wait().await.unwrap();
    assert!(client.is_connected());

    let subscribe = client.subscribe("sensors/temp", QoS::AtLeastOnce).unwrap();
    let subscribe_id = subscribe.id();
    subscribe.wait().await.unwrap();

    let payload = vec![0x31, 0x30, 0x00, 0x32];
    let publish = client
        .publish("sensors/temp", payload.clone(), QoS::AtLeastOnce, false)
        .unwrap();
    let publish_id = publish.id();
    publish.wait().await.unwrap();

    client.disconnect().unwrap().wait().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);

    assert_eq!(
        handler.events(),
        vec![
            Recorded::Connected,
            Recorded::Subscribed(subscribe_id),
            Recorded::Message {
                topic: "sensors/temp".to_string(),
                payload,
            },
            Recorded::Published(publish_id),
            Recorded::Disconnected,
        ]
    );
    assert_eq!(transport.connected_sessions(), 0);
}

#[tokio::test]
async fn test_callbacks_observe_updated_connectivity() {
    let (client, _transport, handler) = connected_client("c1").await;
    client.disconnect().unwrap().wait().await.unwrap();

    let observed = handler.observed();
    assert_eq!(observed[0], (Recorded::Connected, true));
    assert_eq!(observed[1], (Recorded::Disconnected, false));
}

#[tokio::test]
async fn test_connect_passes_session_options_to_transport() {
    let transport = SimulatedTransport::new();
    let client = MqttClient::connect_to(
        Arc::new(transport.clone()),
        test_config("sensor-7").with_clean_session(false),
        test_helpers::RecordingHandler::new(),
    )
    .unwrap();

    client.connect().unwrap().wait().await.unwrap();

    let calls = transport.calls();
    assert_eq!(
        calls[0],
        TransportCall::Create {
            address: "tcp://broker.test:1883".to_string(),
            client_id: "sensor-7".to_string(),
        }
    );
    assert_eq!(
        calls[1],
        TransportCall::Connect {
            client_id: "sensor-7".to_string(),
            clean_session: false,
            keep_alive: Duration::from_secs(20),
        }
    );
}

#[tokio::test]
async fn test_second_connect_is_rejected() {
    let (client, transport, handler) = connected_client("c1").await;

    let err = client.connect().unwrap_err();
    assert!(matches!(
        err,
        ClientError::AlreadyConnected {
            state: ConnectionState::Connected
        }
    ));

    transport.flush().await;
    assert_eq!(handler.count(|e| *e == Recorded::Connected), 1);
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_connect_rejected_while_connecting() {
    let (client, transport, _handler) = simulated_client("c1");
    transport.set_connect_behavior(ConnectBehavior::Silent);

    let _pending = client.connect().unwrap();
    assert_eq!(client.state(), ConnectionState::Connecting);

    let err = client.connect().unwrap_err();
    assert!(matches!(
        err,
        ClientError::AlreadyConnected {
            state: ConnectionState::Connecting
        }
    ));
}

#[tokio::test]
async fn test_requests_without_session_fail_synchronously() {
    let (client, transport, handler) = simulated_client("c1");

    let publish = client.publish("a/b", "x", QoS::AtMostOnce, false).unwrap_err();
    let subscribe = client.subscribe("a/#", QoS::AtMostOnce).unwrap_err();
    let disconnect = client.disconnect().unwrap_err();

    assert!(matches!(publish, ClientError::NullClient));
    assert!(matches!(subscribe, ClientError::NullClient));
    assert!(matches!(disconnect, ClientError::NullClient));
    assert!(publish.is_not_connected());

    transport.flush().await;
    assert!(handler.events().is_empty());
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn test_publish_after_disconnect_fails_synchronously() {
    let (client, _transport, _handler) = connected_client("c1").await;
    client.disconnect().unwrap().wait().await.unwrap();

    let err = client
        .publish("a/b", "late", QoS::AtLeastOnce, false)
        .unwrap_err();
    assert!(matches!(err, ClientError::NullClient));
}

#[tokio::test]
async fn test_publish_while_connecting_is_not_connected() {
    let (client, transport, _handler) = simulated_client("c1");
    transport.set_connect_behavior(ConnectBehavior::Silent);
    let _pending = client.connect().unwrap();

    let err = client.publish("a/b", "x", QoS::AtMostOnce, false).unwrap_err();
    assert!(matches!(
        err,
        ClientError::NotConnected {
            state: ConnectionState::Connecting
        }
    ));
}

#[tokio::test]
async fn test_silent_broker_fails_connect_after_request_timeout() {
    let (client, transport, handler) = simulated_client("c1");
    transport.set_connect_behavior(ConnectBehavior::Silent);

    let started = Instant::now();
    let token = client.connect().unwrap();
    let err = token.wait().await.unwrap_err();

    assert!(started.elapsed() >= Duration::from_millis(450));
    assert!(matches!(
        err,
        ClientError::OperationFailed {
            kind: OperationKind::Connect,
            ..
        }
    ));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let failures = handler.count(|e| matches!(e, Recorded::ConnectFailed(_)));
    assert_eq!(failures, 1);
    assert_eq!(handler.count(|e| *e == Recorded::Connected), 0);
}

#[tokio::test]
async fn test_refused_connect_notifies_failure_once() {
    let (client, transport, handler) = simulated_client("c1");
    transport.set_connect_behavior(ConnectBehavior::Refuse("not authorized".to_string()));

    let err = client.connect().unwrap().wait().await.unwrap_err();
    assert!(err.to_string().contains("not authorized"));

    transport.flush().await;
    assert_eq!(
        handler.observed(),
        vec![(Recorded::ConnectFailed("not authorized".to_string()), false)]
    );

    // A failed attempt leaves the client ready for another one.
    transport.set_connect_behavior(ConnectBehavior::Accept);
    client.connect().unwrap().wait().await.unwrap();
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_invalid_address_fails_before_transport() {
    let transport = SimulatedTransport::new();
    let client = MqttClient::new(
        Arc::new(transport.clone()),
        test_helpers::RecordingHandler::new(),
    );

    let err = client
        .configure(mqtt_session::ConnectionConfig::new("broker:1883", "c1"))
        .unwrap_err();
    assert!(err.is_configuration());

    let err = client.connect().unwrap_err();
    assert!(err.is_configuration());
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn test_configure_rejected_while_connected() {
    let (client, _transport, _handler) = connected_client("c1").await;

    let err = client.configure(test_config("other")).unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(client.config().unwrap().client_id, "c1");
}

#[tokio::test]
async fn test_invalid_topics_never_reach_transport() {
    let (client, transport, _handler) = connected_client("c1").await;

    let publish = client
        .publish("sensors/+", "x", QoS::AtMostOnce, false)
        .unwrap_err();
    let subscribe = client.subscribe("sensors/#/temp", QoS::AtMostOnce).unwrap_err();

    assert!(publish.is_configuration());
    assert!(subscribe.is_configuration());
    assert!(!transport.calls().iter().any(|call| matches!(
        call,
        TransportCall::Publish { .. } | TransportCall::Subscribe { .. }
    )));
}

#[tokio::test]
async fn test_synchronous_rejection_skips_callbacks() {
    let (client, transport, handler) = connected_client("c1").await;
    transport.reject_publishes(Some(TransportError::QueueFull));

    let err = client
        .publish("a/b", "x", QoS::AtLeastOnce, false)
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::PublishFailure(TransportError::QueueFull)
    ));

    transport.flush().await;
    assert_eq!(
        handler.count(|e| matches!(e, Recorded::Published(_) | Recorded::PublishFailed(..))),
        0
    );

    transport.reject_publishes(None);
    client
        .publish("a/b", "x", QoS::AtLeastOnce, false)
        .unwrap()
        .wait()
        .await
        .unwrap();
}

#[tokio::test]
async fn test_refused_subscription_reports_failure() {
    let (client, transport, handler) = connected_client("c1").await;
    transport.refuse_subscriptions_to("admin/#");

    let token = client.subscribe("admin/#", QoS::AtLeastOnce).unwrap();
    let id = token.id();
    let err = token.wait().await.unwrap_err();

    assert!(matches!(
        err,
        ClientError::OperationFailed {
            kind: OperationKind::Subscribe,
            ..
        }
    ));
    assert_eq!(
        handler.count(|e| matches!(e, Recorded::SubscribeFailed(op, _) if *op == id)),
        1
    );
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_connection_loss_fails_outstanding_operations() {
    let (client, transport, handler) = connected_client("c1").await;
    transport.hold_acks(true);

    let token = client
        .publish("a/b", "in flight", QoS::AtLeastOnce, false)
        .unwrap();
    let id = token.id();
    transport.drop_connection("network unreachable");

    let err = token.wait().await.unwrap_err();
    assert!(err.to_string().contains("network unreachable"));
    transport.flush().await;

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(
        handler.count(|e| matches!(e, Recorded::PublishFailed(op, _) if *op == id)),
        1
    );
    assert_eq!(handler.count(|e| matches!(e, Recorded::Published(_))), 0);

    let lost: Vec<_> = handler
        .observed()
        .into_iter()
        .filter(|(e, _)| matches!(e, Recorded::ConnectionLost(_)))
        .collect();
    assert_eq!(
        lost,
        vec![(
            Recorded::ConnectionLost("network unreachable".to_string()),
            false
        )]
    );
}

#[tokio::test]
async fn test_publish_and_wait_times_out_without_cancelling() {
    let (client, transport, handler) = connected_client("c1").await;
    transport.hold_acks(true);

    let err = client
        .publish_and_wait(
            "a/b",
            "slow",
            QoS::ExactlyOnce,
            false,
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    transport.release_held();
    assert!(eventually(|| handler.count(|e| matches!(e, Recorded::Published(_))) == 1).await);
}

#[tokio::test]
async fn test_retained_message_delivered_on_subscribe() {
    let (publisher, transport, _) = connected_client("publisher").await;
    publisher
        .publish("config/mode", "eco", QoS::AtLeastOnce, true)
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(transport.retained("config/mode").unwrap().as_ref(), b"eco");

    let handler = test_helpers::RecordingHandler::new();
    let subscriber = MqttClient::connect_to(
        Arc::new(transport.clone()),
        test_config("subscriber"),
        Arc::clone(&handler),
    )
    .unwrap();
    subscriber.connect().unwrap().wait().await.unwrap();
    subscriber
        .subscribe("config/+", QoS::AtLeastOnce)
        .unwrap()
        .wait()
        .await
        .unwrap();

    transport.flush().await;
    assert_eq!(
        handler.messages(),
        vec![("config/mode".to_string(), b"eco".to_vec())]
    );
}

#[tokio::test]
async fn test_disconnect_while_connecting() {
    let (client, transport, handler) = simulated_client("c1");
    transport.set_connect_behavior(ConnectBehavior::Silent);

    let connect = client.connect().unwrap();
    client.disconnect().unwrap().wait().await.unwrap();

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(connect.wait().await.is_err());
    assert_eq!(
        handler.events(),
        vec![
            Recorded::ConnectFailed("disconnected".to_string()),
            Recorded::Disconnected
        ]
    );
}

#[tokio::test]
async fn test_handshake_completing_after_disconnect_request() {
    let transport = ManualTransport::default();
    let handler = test_helpers::RecordingHandler::new();
    let client = MqttClient::connect_to(
        Arc::new(transport.clone()),
        test_config("c1"),
        Arc::clone(&handler),
    )
    .unwrap();

    let connect = client.connect().unwrap();
    let disconnect = client.disconnect().unwrap();
    assert!(client.disconnect_requested());

    // Broker accepts the handshake, then confirms the disconnect
    transport.resolve_next();
    assert_eq!(client.state(), ConnectionState::Disconnecting);
    transport.resolve_next();

    let err = connect.wait().await.unwrap_err();
    assert_eq!(err.to_string(), "connect failed: disconnected");
    disconnect.wait().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(
        handler.observed(),
        vec![
            (Recorded::ConnectFailed("disconnected".to_string()), false),
            (Recorded::Disconnected, false)
        ]
    );
}

#[tokio::test]
async fn test_callbacks_reconnect_after_connection_loss() {
    let transport = SimulatedTransport::new();
    let connects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connects);
    let callbacks = Callbacks::new()
        .on_connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .reconnect_after(Duration::from_millis(20));

    let client =
        MqttClient::connect_to(Arc::new(transport.clone()), test_config("c1"), callbacks).unwrap();
    client.connect().unwrap().wait().await.unwrap();

    transport.drop_connection("broker restarted");
    assert!(eventually(|| connects.load(Ordering::SeqCst) == 2).await);
    assert!(client.is_connected());
    assert_eq!(transport.connected_sessions(), 1);
}

#[tokio::test]
async fn test_connection_lost_hook_replaces_reconnect() {
    let transport = SimulatedTransport::new();
    let connects = Arc::new(AtomicUsize::new(0));
    let losses = Arc::new(Mutex::new(Vec::new()));
    let counter = Arc::clone(&connects);
    let sink = Arc::clone(&losses);
    let callbacks = Callbacks::new()
        .on_connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .on_connection_lost(move |_, cause| sink.lock().unwrap().push(cause.to_string()))
        .reconnect_after(Duration::from_millis(20));

    let client =
        MqttClient::connect_to(Arc::new(transport.clone()), test_config("c1"), callbacks).unwrap();
    client.connect().unwrap().wait().await.unwrap();

    transport.drop_connection("broker restarted");
    assert!(eventually(|| losses.lock().unwrap().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_requested_disconnect_is_not_reconnected() {
    let transport = SimulatedTransport::new();
    transport.set_connect_behavior(ConnectBehavior::Silent);
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&failures);
    let callbacks = Callbacks::new()
        .on_disconnect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .reconnect_after(Duration::from_millis(10));

    let client =
        MqttClient::connect_to(Arc::new(transport.clone()), test_config("c1"), callbacks).unwrap();
    let _connect = client.connect().unwrap();
    client.disconnect().unwrap().wait().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let connects = transport
        .calls()
        .into_iter()
        .filter(|call| matches!(call, TransportCall::Connect { .. }))
        .count();
    assert_eq!(connects, 1);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_reconnect_replaces_transport_handle() {
    let (client, transport, handler) = connected_client("c1").await;
    transport.drop_connection("broker restarted");
    assert!(eventually(|| client.state() == ConnectionState::Disconnected).await);

    client.connect().unwrap().wait().await.unwrap();

    let destroyed = transport
        .calls()
        .into_iter()
        .filter(|call| matches!(call, TransportCall::Destroy { .. }))
        .count();
    assert_eq!(destroyed, 1);
    assert_eq!(handler.count(|e| *e == Recorded::Connected), 2);
    assert_eq!(transport.connected_sessions(), 1);
}

#[tokio::test]
async fn test_dropping_client_destroys_handle() {
    let (client, transport, _handler) = connected_client("c1").await;
    drop(client);
    transport.flush().await;

    assert_eq!(
        transport.calls().last(),
        Some(&TransportCall::Destroy {
            client_id: "c1".to_string()
        })
    );
    assert_eq!(transport.connected_sessions(), 0);
}

#[tokio::test]
async fn test_state_watcher_sees_every_transition() {
    let (client, _transport, _handler) = simulated_client("c1");
    let mut watcher = client.state_watcher();

    client.connect().unwrap().wait().await.unwrap();
    assert!(watcher.has_changed().unwrap());
    assert_eq!(*watcher.borrow_and_update(), ConnectionState::Connected);

    client.disconnect().unwrap().wait().await.unwrap();
    assert_eq!(*watcher.borrow_and_update(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_subscribe_from_connect_callback() {
    let transport = SimulatedTransport::new();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);

    let callbacks = Callbacks::new()
        .on_connect(|client| {
            client
                .subscribe("/temp/shimane", QoS::AtMostOnce)
                .expect("subscribe accepted from callback");
        })
        .on_message(move |_, message| {
            sink.lock()
                .unwrap()
                .push(String::from_utf8_lossy(message.payload()).into_owned());
        });

    let client =
        MqttClient::connect_to(Arc::new(transport.clone()), test_config("c1"), callbacks).unwrap();
    client.connect().unwrap().wait().await.unwrap();
    transport.flush().await;

    transport.inject("/temp/shimane", "21.5");
    assert!(eventually(|| received.lock().unwrap().len() == 1).await);
    assert_eq!(*received.lock().unwrap(), vec!["21.5".to_string()]);
}

/// Transport that keeps every callback set it hands out, so notifications
/// from a replaced handle can be replayed later
#[derive(Clone)]
struct CapturingTransport {
    inner: SimulatedTransport,
    captured: Arc<Mutex<Vec<Arc<dyn TransportCallbacks>>>>,
}

struct CapturingHandle {
    inner: Box<dyn TransportHandle>,
    captured: Arc<Mutex<Vec<Arc<dyn TransportCallbacks>>>>,
}

impl Transport for CapturingTransport {
    fn create(
        &self,
        address: &str,
        client_id: &str,
        persistence: Persistence,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        Ok(Box::new(CapturingHandle {
            inner: self.inner.create(address, client_id, persistence)?,
            captured: Arc::clone(&self.captured),
        }))
    }
}

impl TransportHandle for CapturingHandle {
    fn set_callbacks(&mut self, callbacks: Arc<dyn TransportCallbacks>) {
        self.captured.lock().unwrap().push(Arc::clone(&callbacks));
        self.inner.set_callbacks(callbacks);
    }

    fn connect(
        &mut self,
        options: &ConnectOptions,
        completion: Completion,
    ) -> Result<(), TransportError> {
        self.inner.connect(options, completion)
    }

    fn disconnect(&mut self, completion: Completion) -> Result<(), TransportError> {
        self.inner.disconnect(completion)
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: bytes::Bytes,
        qos: QoS,
        retain: bool,
        completion: Completion,
    ) -> Result<(), TransportError> {
        self.inner.publish(topic, payload, qos, retain, completion)
    }

    fn subscribe(
        &mut self,
        filter: &str,
        qos: QoS,
        completion: Completion,
    ) -> Result<(), TransportError> {
        self.inner.subscribe(filter, qos, completion)
    }

    fn destroy(self: Box<Self>) {
        self.inner.destroy();
    }
}

#[tokio::test]
async fn test_notifications_from_previous_session_are_ignored() {
    let simulated = SimulatedTransport::new();
    let transport = CapturingTransport {
        inner: simulated.clone(),
        captured: Arc::new(Mutex::new(Vec::new())),
    };
    let handler = test_helpers::RecordingHandler::new();
    let client = MqttClient::connect_to(
        Arc::new(transport.clone()),
        test_config("c1"),
        Arc::clone(&handler),
    )
    .unwrap();

    client.connect().unwrap().wait().await.unwrap();
    simulated.drop_connection("first session lost");
    assert!(eventually(|| client.state() == ConnectionState::Disconnected).await);
    client.connect().unwrap().wait().await.unwrap();

    let first_session = Arc::clone(&transport.captured.lock().unwrap()[0]);
    first_session.message_arrived("stale/topic", b"old");
    first_session.connection_lost("late loss report");

    assert!(client.is_connected());
    assert!(handler.messages().is_empty());
    assert_eq!(
        handler.count(|e| matches!(e, Recorded::ConnectionLost(_))),
        1
    );
}

/// Transport that answers nothing until the test resolves completions
/// one at a time, oldest first
#[derive(Clone, Default)]
struct ManualTransport {
    completions: Arc<Mutex<VecDeque<Completion>>>,
}

impl ManualTransport {
    fn resolve_next(&self) {
        let next = self.completions.lock().unwrap().pop_front();
        next.expect("a completion is waiting").succeed();
    }
}

struct ManualHandle {
    completions: Arc<Mutex<VecDeque<Completion>>>,
}

impl ManualHandle {
    fn hold(&self, completion: Completion) -> Result<(), TransportError> {
        self.completions.lock().unwrap().push_back(completion);
        Ok(())
    }
}

impl Transport for ManualTransport {
    fn create(
        &self,
        _address: &str,
        _client_id: &str,
        _persistence: Persistence,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        Ok(Box::new(ManualHandle {
            completions: Arc::clone(&self.completions),
        }))
    }
}

impl TransportHandle for ManualHandle {
    fn set_callbacks(&mut self, _callbacks: Arc<dyn TransportCallbacks>) {}

    fn connect(
        &mut self,
        _options: &ConnectOptions,
        completion: Completion,
    ) -> Result<(), TransportError> {
        self.hold(completion)
    }

    fn disconnect(&mut self, completion: Completion) -> Result<(), TransportError> {
        self.hold(completion)
    }

    fn publish(
        &mut self,
        _topic: &str,
        _payload: bytes::Bytes,
        _qos: QoS,
        _retain: bool,
        completion: Completion,
    ) -> Result<(), TransportError> {
        self.hold(completion)
    }

    fn subscribe(
        &mut self,
        _filter: &str,
        _qos: QoS,
        completion: Completion,
    ) -> Result<(), TransportError> {
        self.hold(completion)
    }

    fn destroy(self: Box<Self>) {}
}
