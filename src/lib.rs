//! MQTT Session - callback-driven MQTT client runtime
//!
//! Manages a single logical broker connection: asynchronous
//! connect/disconnect/publish/subscribe requests, a connection state machine,
//! and delivery of inbound messages and lifecycle events to application
//! handlers.
//!
//! # Overview
//!
//! - [`session`] - connection state machine, operation dispatch and callback routing
//! - [`transport`] - the narrow Transport Adapter seam plus a rumqttc implementation
//! - [`protocol`] - the [`Message`] value, [`QoS`] levels and topic validation
//! - [`config`] - typed connection settings and the TOML configuration file
//! - [`testing`] - an in-process simulated broker
//!
//! # Quick Start
//!
//! ```rust
//! use mqtt_session::config::ConnectionConfig;
//! use mqtt_session::protocol::QoS;
//! use mqtt_session::session::{EventChannel, MqttClient, SessionEvent};
//! use mqtt_session::testing::SimulatedTransport;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let (events, mut receiver) = EventChannel::new();
//! let client = MqttClient::connect_to(
//!     Arc::new(SimulatedTransport::new()),
//!     ConnectionConfig::new("tcp://broker:1883", "c1"),
//!     events,
//! )?;
//!
//! client.connect()?.wait().await?;
//! assert!(client.is_connected());
//!
//! client.subscribe("sensors/temp", QoS::AtLeastOnce)?.wait().await?;
//! client.publish("sensors/temp", vec![0x31, 0x30, 0x00, 0x32], QoS::AtLeastOnce, false)?;
//!
//! while let Some(event) = receiver.recv().await {
//!     if let SessionEvent::Message(message) = event {
//!         assert_eq!(message.payload(), &[0x31, 0x30, 0x00, 0x32]);
//!         break;
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, ConnectionConfig, SessionConfig};
pub use error::{ClientError, ClientResult};
pub use protocol::{Message, QoS};
pub use session::{
    Callbacks, ConnectionState, EventChannel, MqttClient, OperationId, OperationKind,
    OperationToken, SessionEvent, SessionHandler,
};
pub use transport::{MqttTransport, Transport};
