//! rumqttc-backed Transport Adapter
//!
//! Split the same way as the rest of the transport layer:
//!
//! - [`options`] - pure conversion from session settings to rumqttc options
//! - [`event_route`] - pure event classification and completion bookkeeping
//! - [`adapter`] - impure I/O: the rumqttc client and its event loop task
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_session::config::ConnectionConfig;
//! use mqtt_session::protocol::QoS;
//! use mqtt_session::session::{EventChannel, MqttClient};
//!
//! # tokio_test::block_on(async {
//! let (events, mut receiver) = EventChannel::new();
//! let client = MqttClient::with_rumqttc(events)?;
//! client.configure(ConnectionConfig::new("tcp://localhost:1883", "sensor-1"))?;
//! client.connect()?.wait().await?;
//! client.subscribe("sensors/#", QoS::AtLeastOnce)?;
//! # let _ = receiver.recv().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```

pub mod adapter;
pub mod event_route;
pub mod options;

pub use adapter::{RumqttcAdapter, RumqttcHandle, DEFAULT_REQUEST_CAPACITY};
pub use event_route::{route_event, EventRoute, InflightTracker};
pub use options::build_mqtt_options;
