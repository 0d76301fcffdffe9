//! Pure connection state machine
//!
//! ```text
//! Disconnected --connect()--> Connecting --succeeded--> Connected
//! Connected --disconnect()--> Disconnecting --disconnect acked--> Disconnected
//! Connecting --failed--> Disconnected
//! Connected --connection lost--> Disconnected
//! ```

use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

/// Last-known connectivity of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Events that drive state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTrigger {
    ConnectRequested,
    ConnectionSucceeded,
    ConnectionFailed,
    ConnectionLost,
    DisconnectRequested,
    DisconnectSucceeded,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Connecting, Connected or Disconnecting
    pub fn is_live(self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }

    /// Publish and subscribe are only accepted once the handshake completed
    pub fn accepts_operations(self) -> bool {
        self.is_connected()
    }

    /// Next state for a trigger, or `None` when the trigger does not apply
    pub fn next(self, trigger: StateTrigger) -> Option<ConnectionState> {
        use ConnectionState::*;
        use StateTrigger::*;

        match (self, trigger) {
            (Disconnected, ConnectRequested) => Some(Connecting),
            (Connecting, ConnectionSucceeded) => Some(Connected),
            (Connecting, ConnectionFailed) => Some(Disconnected),
            (Connecting | Connected | Disconnecting, ConnectionLost) => Some(Disconnected),
            (Connecting | Connected, DisconnectRequested) => Some(Disconnecting),
            (Disconnecting, DisconnectSucceeded) => Some(Disconnected),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Log a connection state transition
pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!("MQTT connection established");
        }
        (ConnectionState::Connecting, ConnectionState::Disconnected) => {
            warn!("MQTT connection attempt failed");
        }
        (ConnectionState::Connected, ConnectionState::Disconnected) => {
            warn!("MQTT connection lost");
        }
        (ConnectionState::Disconnecting, ConnectionState::Disconnected) => {
            info!("MQTT session closed");
        }
        _ => {
            info!(from = %from, to = %to, "MQTT connection state changed");
        }
    }
}
