//! In-process simulated broker
//!
//! [`SimulatedTransport`] implements the Transport Adapter contract against
//! a broker living in the same process. Requests are processed on a
//! dedicated worker thread, so completions and callbacks always arrive on a
//! thread other than the caller's, just like a real network transport.

use crate::config::{BrokerAddress, Persistence};
use crate::protocol::{topic_matches, QoS};
use crate::transport::{
    Completion, ConnectOptions, Transport, TransportCallbacks, TransportError, TransportHandle,
};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// How the simulated broker answers a connect request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectBehavior {
    #[default]
    Accept,
    /// Refuse the handshake with the given reason
    Refuse(String),
    /// Never answer; the attempt fails once the request timeout elapses
    Silent,
}

/// Request observed by the simulated transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Create {
        address: String,
        client_id: String,
    },
    Connect {
        client_id: String,
        clean_session: bool,
        keep_alive: Duration,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    Subscribe {
        filter: String,
        qos: QoS,
    },
    Disconnect {
        client_id: String,
    },
    Destroy {
        client_id: String,
    },
}

enum Command {
    Connect {
        session: u64,
        completion: Completion,
        request_timeout: Duration,
    },
    Publish {
        session: u64,
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        completion: Completion,
    },
    Subscribe {
        session: u64,
        filter: String,
        completion: Completion,
    },
    Disconnect {
        session: u64,
        completion: Completion,
    },
    Destroy {
        session: u64,
    },
    Inject {
        topic: String,
        payload: Bytes,
    },
    DropConnection {
        cause: String,
    },
    Release,
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct Session {
    client_id: String,
    callbacks: Option<Arc<dyn TransportCallbacks>>,
    connected: bool,
    subscriptions: Vec<String>,
}

#[derive(Default)]
struct BrokerState {
    connect_behavior: ConnectBehavior,
    reject_publish: Option<TransportError>,
    reject_subscribe: Option<TransportError>,
    refused_filters: HashSet<String>,
    hold_acks: bool,
    held: Vec<Completion>,
    next_session: u64,
    sessions: HashMap<u64, Session>,
    retained: HashMap<String, Bytes>,
    calls: Vec<TransportCall>,
}

impl BrokerState {
    /// Callbacks of connected sessions subscribed to `topic`
    fn subscribers(&self, topic: &str) -> Vec<Arc<dyn TransportCallbacks>> {
        self.sessions
            .values()
            .filter(|session| session.connected)
            .filter(|session| {
                session
                    .subscriptions
                    .iter()
                    .any(|filter| topic_matches(filter, topic))
            })
            .filter_map(|session| session.callbacks.clone())
            .collect()
    }

    fn is_connected(&self, session: u64) -> bool {
        self.sessions
            .get(&session)
            .map(|entry| entry.connected)
            .unwrap_or(false)
    }
}

struct Shared {
    state: Arc<Mutex<BrokerState>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock_state(&self.state)
    }

    fn send(&self, command: Command) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::Closed)
    }
}

fn lock_state(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transport Adapter backed by an in-process broker
#[derive(Clone)]
pub struct SimulatedTransport {
    shared: Arc<Shared>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(BrokerState::default()));
        let (commands, receiver) = mpsc::unbounded_channel();

        let worker_state = Arc::clone(&state);
        std::thread::Builder::new()
            .name("simulated-broker".to_string())
            .spawn(move || run_broker(worker_state, receiver))
            .map_err(|e| warn!("Failed to start simulated broker thread: {}", e))
            .ok();

        Self {
            shared: Arc::new(Shared { state, commands }),
        }
    }

    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        self.shared.lock().connect_behavior = behavior;
    }

    /// Broker answers SUBSCRIBE for this exact filter with a failure code
    pub fn refuse_subscriptions_to(&self, filter: &str) {
        self.shared.lock().refused_filters.insert(filter.to_string());
    }

    /// Make `publish` fail synchronously with `error` (None restores)
    pub fn reject_publishes(&self, error: Option<TransportError>) {
        self.shared.lock().reject_publish = error;
    }

    /// Make `subscribe` fail synchronously with `error` (None restores)
    pub fn reject_subscribes(&self, error: Option<TransportError>) {
        self.shared.lock().reject_subscribe = error;
    }

    /// Hold QoS 1/2 publish and subscribe acknowledgements until released
    pub fn hold_acks(&self, hold: bool) {
        self.shared.lock().hold_acks = hold;
    }

    pub fn release_held(&self) {
        let _ = self.shared.send(Command::Release);
    }

    /// Deliver a message from another (imaginary) publisher
    pub fn inject<T: Into<String>, P: Into<Bytes>>(&self, topic: T, payload: P) {
        let _ = self.shared.send(Command::Inject {
            topic: topic.into(),
            payload: payload.into(),
        });
    }

    /// Break every live connection with `cause`
    pub fn drop_connection(&self, cause: &str) {
        let _ = self.shared.send(Command::DropConnection {
            cause: cause.to_string(),
        });
    }

    /// Requests observed so far, oldest first
    pub fn calls(&self) -> Vec<TransportCall> {
        self.shared.lock().calls.clone()
    }

    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        self.shared.lock().retained.get(topic).cloned()
    }

    pub fn connected_sessions(&self) -> usize {
        self.shared
            .lock()
            .sessions
            .values()
            .filter(|session| session.connected)
            .count()
    }

    /// Wait until every command submitted so far has been processed
    pub async fn flush(&self) {
        let (done, processed) = oneshot::channel();
        if self.shared.send(Command::Flush(done)).is_ok() {
            let _ = processed.await;
        }
    }
}

impl Transport for SimulatedTransport {
    fn create(
        &self,
        address: &str,
        client_id: &str,
        _persistence: Persistence,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        BrokerAddress::parse(address).map_err(|e| TransportError::InvalidAddress(e.to_string()))?;

        let mut state = self.shared.lock();
        state.next_session += 1;
        let session = state.next_session;
        state.sessions.insert(
            session,
            Session {
                client_id: client_id.to_string(),
                ..Session::default()
            },
        );
        state.calls.push(TransportCall::Create {
            address: address.to_string(),
            client_id: client_id.to_string(),
        });

        Ok(Box::new(SimulatedHandle {
            session,
            client_id: client_id.to_string(),
            shared: Arc::clone(&self.shared),
            connect_requested: false,
        }))
    }
}

/// Handle onto one simulated broker session
pub struct SimulatedHandle {
    session: u64,
    client_id: String,
    shared: Arc<Shared>,
    connect_requested: bool,
}

impl SimulatedHandle {
    fn require_connect_requested(&self) -> Result<(), TransportError> {
        if self.connect_requested {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

impl TransportHandle for SimulatedHandle {
    fn set_callbacks(&mut self, callbacks: Arc<dyn TransportCallbacks>) {
        if let Some(session) = self.shared.lock().sessions.get_mut(&self.session) {
            session.callbacks = Some(callbacks);
        }
    }

    fn connect(
        &mut self,
        options: &ConnectOptions,
        completion: Completion,
    ) -> Result<(), TransportError> {
        if self.connect_requested {
            return Err(TransportError::Rejected(
                "handle already connected".to_string(),
            ));
        }

        self.shared.lock().calls.push(TransportCall::Connect {
            client_id: self.client_id.clone(),
            clean_session: options.clean_session,
            keep_alive: options.keep_alive,
        });
        self.shared.send(Command::Connect {
            session: self.session,
            completion,
            request_timeout: options.request_timeout,
        })?;
        self.connect_requested = true;
        Ok(())
    }

    fn disconnect(&mut self, completion: Completion) -> Result<(), TransportError> {
        self.require_connect_requested()?;
        self.shared.lock().calls.push(TransportCall::Disconnect {
            client_id: self.client_id.clone(),
        });
        self.shared.send(Command::Disconnect {
            session: self.session,
            completion,
        })
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        completion: Completion,
    ) -> Result<(), TransportError> {
        self.require_connect_requested()?;
        {
            let mut state = self.shared.lock();
            if let Some(error) = state.reject_publish.clone() {
                return Err(error);
            }
            state.calls.push(TransportCall::Publish {
                topic: topic.to_string(),
                payload: payload.clone(),
                qos,
                retain,
            });
        }
        self.shared.send(Command::Publish {
            session: self.session,
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            completion,
        })
    }

    fn subscribe(
        &mut self,
        filter: &str,
        qos: QoS,
        completion: Completion,
    ) -> Result<(), TransportError> {
        self.require_connect_requested()?;
        {
            let mut state = self.shared.lock();
            if let Some(error) = state.reject_subscribe.clone() {
                return Err(error);
            }
            state.calls.push(TransportCall::Subscribe {
                filter: filter.to_string(),
                qos,
            });
        }
        self.shared.send(Command::Subscribe {
            session: self.session,
            filter: filter.to_string(),
            completion,
        })
    }

    fn destroy(self: Box<Self>) {
        drop(self);
    }
}

impl Drop for SimulatedHandle {
    fn drop(&mut self) {
        self.shared.lock().calls.push(TransportCall::Destroy {
            client_id: self.client_id.clone(),
        });
        let _ = self.shared.send(Command::Destroy {
            session: self.session,
        });
    }
}

/// Worker loop; runs until every sender is gone
fn run_broker(state: Arc<Mutex<BrokerState>>, mut commands: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.blocking_recv() {
        process(&state, command);
    }
    debug!("Simulated broker stopped");
}

/// Apply one command; callbacks run after the state lock is released
fn process(state: &Mutex<BrokerState>, command: Command) {
    match command {
        Command::Connect {
            session,
            completion,
            request_timeout,
        } => {
            let behavior = {
                let mut broker = lock_state(state);
                let behavior = broker.connect_behavior.clone();
                if behavior == ConnectBehavior::Accept {
                    if let Some(entry) = broker.sessions.get_mut(&session) {
                        entry.connected = true;
                    }
                }
                behavior
            };

            match behavior {
                ConnectBehavior::Accept => completion.succeed(),
                ConnectBehavior::Refuse(reason) => completion.fail(reason),
                ConnectBehavior::Silent => {
                    std::thread::spawn(move || {
                        std::thread::sleep(request_timeout);
                        completion.fail(format!("connect timed out after {request_timeout:?}"));
                    });
                }
            }
        }
        Command::Publish {
            session,
            topic,
            payload,
            qos,
            retain,
            completion,
        } => {
            let (subscribers, hold) = {
                let mut broker = lock_state(state);
                if !broker.is_connected(session) {
                    drop(broker);
                    completion.fail("not connected");
                    return;
                }
                if retain {
                    if payload.is_empty() {
                        broker.retained.remove(&topic);
                    } else {
                        broker.retained.insert(topic.clone(), payload.clone());
                    }
                }
                (broker.subscribers(&topic), broker.hold_acks && qos != QoS::AtMostOnce)
            };

            for callbacks in subscribers {
                callbacks.message_arrived(&topic, &payload);
            }
            if hold {
                lock_state(state).held.push(completion);
            } else {
                completion.succeed();
            }
        }
        Command::Subscribe {
            session,
            filter,
            completion,
        } => {
            let outcome = {
                let mut broker = lock_state(state);
                if !broker.is_connected(session) {
                    Err("not connected".to_string())
                } else if broker.refused_filters.contains(&filter) {
                    Err("subscription refused by broker".to_string())
                } else {
                    let retained: Vec<(String, Bytes)> = broker
                        .retained
                        .iter()
                        .filter(|(topic, _)| topic_matches(&filter, topic))
                        .map(|(topic, payload)| (topic.clone(), payload.clone()))
                        .collect();
                    let hold = broker.hold_acks;
                    let entry = broker.sessions.get_mut(&session);
                    let callbacks = entry.and_then(|entry| {
                        entry.subscriptions.push(filter.clone());
                        entry.callbacks.clone()
                    });
                    Ok((retained, callbacks, hold))
                }
            };

            match outcome {
                Err(reason) => completion.fail(reason),
                Ok((retained, callbacks, hold)) => {
                    if hold {
                        lock_state(state).held.push(completion);
                    } else {
                        completion.succeed();
                    }
                    if let Some(callbacks) = callbacks {
                        for (topic, payload) in retained {
                            callbacks.message_arrived(&topic, &payload);
                        }
                    }
                }
            }
        }
        Command::Disconnect {
            session,
            completion,
        } => {
            if let Some(entry) = lock_state(state).sessions.get_mut(&session) {
                entry.connected = false;
                entry.subscriptions.clear();
            }
            completion.succeed();
        }
        Command::Destroy { session } => {
            lock_state(state).sessions.remove(&session);
        }
        Command::Inject { topic, payload } => {
            let subscribers = lock_state(state).subscribers(&topic);
            for callbacks in subscribers {
                callbacks.message_arrived(&topic, &payload);
            }
        }
        Command::DropConnection { cause } => {
            let (lost, held) = {
                let mut broker = lock_state(state);
                let lost: Vec<Arc<dyn TransportCallbacks>> = broker
                    .sessions
                    .values_mut()
                    .filter(|session| session.connected)
                    .filter_map(|session| {
                        session.connected = false;
                        session.subscriptions.clear();
                        session.callbacks.clone()
                    })
                    .collect();
                (lost, std::mem::take(&mut broker.held))
            };

            for callbacks in lost {
                callbacks.connection_lost(&cause);
            }
            for completion in held {
                completion.fail(cause.as_str());
            }
        }
        Command::Release => {
            let held = std::mem::take(&mut lock_state(state).held);
            for completion in held {
                completion.succeed();
            }
        }
        Command::Flush(done) => {
            let _ = done.send(());
        }
    }
}
