//! Testing utilities
//!
//! Provides an in-process simulated broker so the session runtime can be
//! exercised without a real MQTT broker.

pub mod mocks;

pub use mocks::{ConnectBehavior, SimulatedHandle, SimulatedTransport, TransportCall};
