//! Pure routing of rumqttc events and completion bookkeeping
//!
//! rumqttc reports progress as a stream of incoming and outgoing packets.
//! [`route_event`] classifies each event and [`InflightTracker`] maps
//! packet identifiers back to the completion of the request that produced
//! them.

use crate::protocol::QoS;
use crate::transport::Completion;
use bytes::Bytes;
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode};
use std::collections::{HashMap, VecDeque};

/// Routing decisions for rumqttc events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker answered the handshake
    ConnectionAcknowledged { accepted: bool, detail: String },
    /// Message delivered on a subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// Publish written to the socket with the assigned packet id
    PublishSent { pkid: u16 },
    /// Broker finished the QoS 1/2 acknowledgement flow
    PublishAcknowledged { pkid: u16 },
    SubscribeSent { pkid: u16 },
    SubscriptionConfirmed { pkid: u16, refused: bool },
    /// Our DISCONNECT was written
    DisconnectSent,
    /// Broker closed the session
    Disconnected,
    /// Keep-alive and other protocol chatter
    InfrastructureEvent(String),
}

/// Classify a rumqttc event
pub fn route_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => match incoming {
            Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                accepted: connack.code == ConnectReturnCode::Success,
                detail: format!("{:?}", connack.code),
            },
            Packet::Publish(publish) => EventRoute::MessageReceived {
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
            },
            Packet::PubAck(puback) => EventRoute::PublishAcknowledged { pkid: puback.pkid },
            Packet::PubComp(pubcomp) => EventRoute::PublishAcknowledged { pkid: pubcomp.pkid },
            Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                pkid: suback.pkid,
                refused: suback
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure)),
            },
            Packet::Disconnect => EventRoute::Disconnected,
            other => EventRoute::InfrastructureEvent(format!("{other:?}")),
        },
        Event::Outgoing(outgoing) => match outgoing {
            Outgoing::Publish(pkid) => EventRoute::PublishSent { pkid: *pkid },
            Outgoing::Subscribe(pkid) => EventRoute::SubscribeSent { pkid: *pkid },
            Outgoing::Disconnect => EventRoute::DisconnectSent,
            other => EventRoute::InfrastructureEvent(format!("{other:?}")),
        },
    }
}

/// Completions of requests handed to rumqttc but not yet resolved.
///
/// Requests leave the client queue in submission order, so queued entries
/// are matched to the packet ids of outgoing events first in first out.
#[derive(Debug, Default)]
pub struct InflightTracker {
    queued_publishes: VecDeque<(QoS, Completion)>,
    queued_subscribes: VecDeque<Completion>,
    awaiting_puback: HashMap<u16, Completion>,
    awaiting_suback: HashMap<u16, Completion>,
    disconnect: Option<Completion>,
}

impl InflightTracker {
    pub fn queue_publish(&mut self, qos: QoS, completion: Completion) {
        self.queued_publishes.push_back((qos, completion));
    }

    pub fn queue_subscribe(&mut self, completion: Completion) {
        self.queued_subscribes.push_back(completion);
    }

    pub fn queue_disconnect(&mut self, completion: Completion) {
        self.disconnect = Some(completion);
    }

    pub fn disconnect_requested(&self) -> bool {
        self.disconnect.is_some()
    }

    pub fn take_disconnect(&mut self) -> Option<Completion> {
        self.disconnect.take()
    }

    /// Record progress for a routed event.
    ///
    /// Returns completions that are now resolved together with their
    /// outcome; callers resolve them after releasing the tracker.
    pub fn advance(&mut self, route: &EventRoute) -> Vec<(Completion, Result<(), String>)> {
        let mut resolved = Vec::new();
        match route {
            EventRoute::PublishSent { pkid } => {
                if let Some((qos, completion)) = self.queued_publishes.pop_front() {
                    if qos == QoS::AtMostOnce {
                        resolved.push((completion, Ok(())));
                    } else {
                        self.awaiting_puback.insert(*pkid, completion);
                    }
                }
            }
            EventRoute::PublishAcknowledged { pkid } => {
                if let Some(completion) = self.awaiting_puback.remove(pkid) {
                    resolved.push((completion, Ok(())));
                }
            }
            EventRoute::SubscribeSent { pkid } => {
                if let Some(completion) = self.queued_subscribes.pop_front() {
                    self.awaiting_suback.insert(*pkid, completion);
                }
            }
            EventRoute::SubscriptionConfirmed { pkid, refused } => {
                if let Some(completion) = self.awaiting_suback.remove(pkid) {
                    let outcome = if *refused {
                        Err("subscription refused by broker".to_string())
                    } else {
                        Ok(())
                    };
                    resolved.push((completion, outcome));
                }
            }
            EventRoute::DisconnectSent => {
                if let Some(completion) = self.disconnect.take() {
                    resolved.push((completion, Ok(())));
                }
            }
            _ => {}
        }
        resolved
    }

    /// Take every unresolved completion, oldest publishes first
    pub fn drain(&mut self) -> Vec<Completion> {
        let mut pending: Vec<Completion> = self
            .queued_publishes
            .drain(..)
            .map(|(_, completion)| completion)
            .collect();
        pending.extend(self.awaiting_puback.drain().map(|(_, completion)| completion));
        pending.extend(self.queued_subscribes.drain(..));
        pending.extend(self.awaiting_suback.drain().map(|(_, completion)| completion));
        pending.extend(self.disconnect.take());
        pending
    }
}
