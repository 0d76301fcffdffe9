//! Message values, QoS levels and topic rules
//!
//! This module holds the plain data that crosses the session boundary:
//! the immutable [`Message`] delivered to handlers, the [`QoS`] level
//! attached to publish/subscribe requests, and topic validation/matching.

pub mod message;
pub mod topics;

pub use message::*;
pub use topics::*;
