//! Error taxonomy for the MQTT session runtime
//!
//! Every public operation either fails synchronously with one of these
//! variants or is accepted and later resolves through exactly one terminal
//! callback. Asynchronous failures only surface here when a caller awaits an
//! [`OperationToken`](crate::session::OperationToken).

use crate::config::ConfigError;
use crate::session::{ConnectionState, OperationKind};
use crate::transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Main error type for session operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Connection failure: {0}")]
    ConnectionFailure(#[source] TransportError),

    #[error("Already connected - current state: {state:?}")]
    AlreadyConnected { state: ConnectionState },

    #[error("Subscribe failure: {0}")]
    SubscribeFailure(#[source] TransportError),

    #[error("Publish failure: {0}")]
    PublishFailure(#[source] TransportError),

    #[error("Disconnect failure: {0}")]
    DisconnectFailure(#[source] TransportError),

    #[error("No active transport handle")]
    NullClient,

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("{kind} timed out after {after:?}")]
    Timeout { kind: OperationKind, after: Duration },

    #[error("{kind} failed: {reason}")]
    OperationFailed { kind: OperationKind, reason: String },

    #[error("{kind} was abandoned before completing")]
    Abandoned { kind: OperationKind },
}

impl ClientError {
    /// Create a configuration error from a free-form message
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration(ConfigError::InvalidConfig(message.into()))
    }

    /// Map a synchronous transport rejection to the failure of the given operation
    pub fn rejected(kind: OperationKind, error: TransportError) -> Self {
        match kind {
            OperationKind::Connect => Self::ConnectionFailure(error),
            OperationKind::Disconnect => Self::DisconnectFailure(error),
            OperationKind::Publish => Self::PublishFailure(error),
            OperationKind::Subscribe => Self::SubscribeFailure(error),
        }
    }

    /// True for failures raised before any transport call was made
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// True when the operation was refused because no session is live
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NullClient | Self::NotConnected { .. })
    }

    /// True when a bounded wait expired before the operation resolved
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type for session operations
pub type ClientResult<T> = Result<T, ClientError>;
