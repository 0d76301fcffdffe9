//! Callback routing from transport notifications to the session handler
//!
//! Each client owns one [`CallbackRouter`]. Transport callbacks and operation
//! completions are registered with the session generation current at the
//! time of `connect()`, so notifications from a destroyed handle can never
//! reach the handler of a newer session.

use super::client::{ClientInner, MqttClient};
use super::handler::SessionHandler;
use super::pending::{
    OperationId, OperationKind, OperationOutcome, OperationToken, PendingOperation,
    PendingOperations, Settlement,
};
use super::state::{log_state_transition, ConnectionState, StateTrigger};
use crate::protocol::Message;
use crate::transport::{Completion, TransportCallbacks};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tracing::{debug, warn};

type Drained = Vec<(OperationId, PendingOperation, OperationOutcome)>;

/// Failure reason for a connect attempt closed by `disconnect()`
const DISCONNECTED: &str = "disconnected";

pub(crate) struct CallbackRouter {
    state: watch::Sender<ConnectionState>,
    /// Guards the registry; state transitions happen while it is held
    pending: Mutex<PendingOperations>,
    generation: AtomicU64,
    /// Generation whose disconnect was accepted; 0 when none
    disconnect_generation: AtomicU64,
    handler: Arc<dyn SessionHandler>,
    client: Weak<ClientInner>,
}

impl CallbackRouter {
    pub fn new(handler: Arc<dyn SessionHandler>, client: Weak<ClientInner>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            pending: Mutex::new(PendingOperations::default()),
            generation: AtomicU64::new(0),
            disconnect_generation: AtomicU64::new(0),
            handler,
            client,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// True once a disconnect was accepted for the current session
    pub fn disconnect_requested(&self) -> bool {
        let generation = self.generation();
        generation != 0 && self.disconnect_generation.load(Ordering::SeqCst) == generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingOperations> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a trigger; callers hold the registry lock
    fn apply(&self, trigger: StateTrigger) -> Option<(ConnectionState, ConnectionState)> {
        let mut change = None;
        self.state.send_if_modified(|state| match state.next(trigger) {
            Some(next) => {
                change = Some((*state, next));
                *state = next;
                true
            }
            None => false,
        });

        if let Some((from, to)) = change {
            log_state_transition(from, to);
        }
        change
    }

    /// Open a new session generation and register its connect operation
    pub fn begin_session(&self) -> Result<(OperationToken, u64), ConnectionState> {
        let mut pending = self.lock_pending();
        let current = self.state();
        if self.apply(StateTrigger::ConnectRequested).is_none() {
            return Err(current);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, "Session generation opened");
        Ok((pending.register(OperationKind::Connect, generation), generation))
    }

    /// Close a session whose connect request never reached the transport
    pub fn abort_session(&self, generation: u64, reason: &str) {
        let drained = {
            let mut pending = self.lock_pending();
            if !self.is_current(generation) {
                return;
            }
            self.apply(StateTrigger::ConnectionFailed);
            pending.drain_generation(generation, |kind| terminal_outcome(kind, reason))
        };
        self.settle_drained(drained);
    }

    /// Register a publish or subscribe; only accepted while connected
    pub fn register(&self, kind: OperationKind) -> Result<OperationToken, ConnectionState> {
        let mut pending = self.lock_pending();
        let state = self.state();
        if !state.accepts_operations() {
            return Err(state);
        }
        Ok(pending.register(kind, self.generation()))
    }

    /// Move to Disconnecting and register the disconnect operation
    pub fn begin_disconnect(&self) -> Result<(OperationToken, ConnectionState), ConnectionState> {
        let mut pending = self.lock_pending();
        let previous = self.state();
        if self.apply(StateTrigger::DisconnectRequested).is_none() {
            return Err(previous);
        }
        self.disconnect_generation
            .store(self.generation(), Ordering::SeqCst);
        Ok((
            pending.register(OperationKind::Disconnect, self.generation()),
            previous,
        ))
    }

    /// Undo `begin_disconnect` after the transport refused the request
    pub fn cancel_disconnect(&self, id: OperationId, previous: ConnectionState) {
        let mut pending = self.lock_pending();
        pending.take(id);
        self.disconnect_generation.store(0, Ordering::SeqCst);
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnecting {
                *state = previous;
                true
            } else {
                false
            }
        });
    }

    /// Drop a record whose request the transport refused synchronously
    pub fn forget(&self, id: OperationId) {
        self.lock_pending().take(id);
    }

    /// Confirm the transport accepted the request
    pub fn submitted(&self, id: OperationId) {
        let ready = self.lock_pending().mark_submitted(id);
        if let Some((op, outcome)) = ready {
            self.dispatch(id, op, outcome);
        }
    }

    /// Completion routed back to this router for an operation
    pub fn completion(self: &Arc<Self>, id: OperationId) -> Completion {
        let on_success = Arc::clone(self);
        let on_failure = Arc::clone(self);
        Completion::new(
            move || on_success.settle(id, Ok(())),
            move |reason| on_failure.settle(id, Err(reason)),
        )
    }

    /// Connection-level callbacks bound to a session generation
    pub fn callbacks(self: &Arc<Self>, generation: u64) -> Arc<dyn TransportCallbacks> {
        Arc::new(RoutedCallbacks {
            router: Arc::clone(self),
            generation,
        })
    }

    fn settle(&self, id: OperationId, outcome: OperationOutcome) {
        let settlement = self.lock_pending().settle(id, outcome);
        match settlement {
            Settlement::Dispatch(op, outcome) => self.dispatch(id, op, outcome),
            Settlement::Deferred => {
                debug!(operation = %id, "Outcome held until submission completes");
            }
            Settlement::Unknown => {
                debug!(operation = %id, "Ignoring notification for consumed operation");
            }
        }
    }

    fn dispatch(&self, id: OperationId, op: PendingOperation, outcome: OperationOutcome) {
        debug!(
            operation = %id,
            kind = %op.kind,
            success = outcome.is_ok(),
            "Routing operation outcome"
        );

        match op.kind {
            OperationKind::Connect => self.finish_connect(op, outcome),
            OperationKind::Disconnect => self.finish_disconnect(op, outcome),
            OperationKind::Publish | OperationKind::Subscribe => {
                if self.is_current(op.generation) {
                    self.notify_operation(id, op.kind, &outcome);
                } else {
                    warn!(operation = %id, "Dropping notification from a previous session");
                }
                op.resolve(outcome);
            }
        }
    }

    fn finish_connect(&self, op: PendingOperation, outcome: OperationOutcome) {
        match outcome {
            Ok(()) => {
                let connected = {
                    let _pending = self.lock_pending();
                    self.is_current(op.generation)
                        && self.apply(StateTrigger::ConnectionSucceeded).is_some()
                };
                if connected {
                    self.with_client(|handler, client| handler.on_connect(client));
                    op.resolve(Ok(()));
                } else {
                    debug!("Handshake completed after the session was closed");
                    self.fail_connect(op, DISCONNECTED.to_string());
                }
            }
            Err(reason) => {
                let ended = self.end_session(
                    op.generation,
                    &[StateTrigger::ConnectionFailed, StateTrigger::ConnectionLost],
                    &reason,
                );
                match ended {
                    Some((from, drained)) => {
                        self.settle_drained(drained);
                        self.fail_connect(op, reason.clone());
                        self.notify_session_end(from, &reason);
                    }
                    None => self.fail_connect(op, reason),
                }
            }
        }
    }

    /// The single terminal notification of a failed connect attempt
    fn fail_connect(&self, op: PendingOperation, reason: String) {
        self.with_client(|handler, client| handler.on_connect_failure(client, &reason));
        op.resolve(Err(reason));
    }

    fn finish_disconnect(&self, op: PendingOperation, outcome: OperationOutcome) {
        match outcome {
            Ok(()) => {
                let ended = self.end_session(
                    op.generation,
                    &[StateTrigger::DisconnectSucceeded],
                    DISCONNECTED,
                );
                if let Some((_, drained)) = ended {
                    self.settle_drained(drained);
                    self.with_client(|handler, client| handler.on_disconnect(client));
                }
                op.resolve(Ok(()));
            }
            Err(reason) => {
                // The link state is unknown once a disconnect fails; treat it as lost.
                let ended =
                    self.end_session(op.generation, &[StateTrigger::ConnectionLost], &reason);
                if let Some((_, drained)) = ended {
                    self.settle_drained(drained);
                    self.with_client(|handler, client| {
                        handler.on_connection_lost(client, &reason)
                    });
                }
                op.resolve(Err(reason));
            }
        }
    }

    fn connection_lost(&self, generation: u64, cause: &str) {
        match self.end_session(generation, &[StateTrigger::ConnectionLost], cause) {
            Some((from, drained)) => {
                self.settle_drained(drained);
                self.notify_session_end(from, cause);
            }
            None => warn!(generation, cause, "Ignoring connection loss for inactive session"),
        }
    }

    fn message_arrived(&self, generation: u64, topic: &str, payload: &[u8]) {
        if !self.is_current(generation) {
            warn!(generation, topic, "Dropping message from a previous session");
            return;
        }

        let message = Message::copy_from(topic, payload);
        debug!(topic, bytes = message.len(), "Routing inbound message");
        self.with_client(|handler, client| handler.on_message(client, message));
    }

    /// Transition out of a live session and settle everything it still owns
    fn end_session(
        &self,
        generation: u64,
        triggers: &[StateTrigger],
        reason: &str,
    ) -> Option<(ConnectionState, Drained)> {
        let mut pending = self.lock_pending();
        if !self.is_current(generation) {
            return None;
        }

        let (from, _) = triggers
            .iter()
            .find_map(|trigger| self.apply(*trigger))?;
        let drained = pending.drain_generation(generation, |kind| terminal_outcome(kind, reason));
        Some((from, drained))
    }

    fn settle_drained(&self, drained: Drained) {
        for (id, op, outcome) in drained {
            match (op.kind, &outcome) {
                (OperationKind::Connect, Err(reason)) => self
                    .with_client(|handler, client| handler.on_connect_failure(client, reason)),
                (OperationKind::Publish | OperationKind::Subscribe, _) => {
                    self.notify_operation(id, op.kind, &outcome)
                }
                _ => {}
            }
            op.resolve(outcome);
        }
    }

    /// Session-level notification for a session that just ended.
    ///
    /// A session that never left Connecting has nothing to add; its connect
    /// operation already reported the failure.
    fn notify_session_end(&self, from: ConnectionState, cause: &str) {
        match from {
            ConnectionState::Connecting => {}
            ConnectionState::Disconnecting => {
                self.with_client(|handler, client| handler.on_disconnect(client))
            }
            _ => self.with_client(|handler, client| handler.on_connection_lost(client, cause)),
        }
    }

    fn notify_operation(&self, id: OperationId, kind: OperationKind, outcome: &OperationOutcome) {
        self.with_client(|handler, client| match (kind, outcome) {
            (OperationKind::Publish, Ok(())) => handler.on_publish(client, id),
            (OperationKind::Publish, Err(reason)) => {
                handler.on_publish_failure(client, id, reason)
            }
            (OperationKind::Subscribe, Ok(())) => handler.on_subscribe(client, id),
            (OperationKind::Subscribe, Err(reason)) => {
                handler.on_subscribe_failure(client, id, reason)
            }
            _ => {}
        });
    }

    /// Run a handler method; skipped once the owning client is gone
    fn with_client<F>(&self, notify: F)
    where
        F: FnOnce(&dyn SessionHandler, &MqttClient),
    {
        match self.client.upgrade() {
            Some(inner) => {
                let client = MqttClient::from_inner(inner);
                notify(self.handler.as_ref(), &client);
            }
            None => debug!("Client dropped - notification discarded"),
        }
    }
}

/// Outcome given to operations still pending when their session ends
fn terminal_outcome(kind: OperationKind, reason: &str) -> OperationOutcome {
    match kind {
        OperationKind::Disconnect => Ok(()),
        _ => Err(reason.to_string()),
    }
}

/// Transport callbacks for one session generation
struct RoutedCallbacks {
    router: Arc<CallbackRouter>,
    generation: u64,
}

impl TransportCallbacks for RoutedCallbacks {
    fn connection_lost(&self, cause: &str) {
        self.router.connection_lost(self.generation, cause);
    }

    fn message_arrived(&self, topic: &str, payload: &[u8]) {
        self.router.message_arrived(self.generation, topic, payload);
    }
}
