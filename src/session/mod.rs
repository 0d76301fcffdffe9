//! MQTT session core: connection state machine, operation dispatch and
//! callback routing.

pub mod client;
pub mod handler;
pub mod pending;
mod router;
pub mod state;

pub use client::MqttClient;
pub use handler::{Callbacks, EventChannel, SessionEvent, SessionHandler};
pub use pending::{OperationId, OperationKind, OperationToken};
pub use state::{ConnectionState, StateTrigger};
