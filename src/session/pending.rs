//! Pending operation registry and completion tokens
//!
//! Each accepted request is recorded as a [`PendingOperation`] until the
//! matching notification consumes it. Consumption removes the record, so a
//! late or duplicate notification finds nothing and is dropped.

use crate::error::{ClientError, ClientResult};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;

/// Request kinds tracked by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Connect,
    Disconnect,
    Publish,
    Subscribe,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Connect => "connect",
            OperationKind::Disconnect => "disconnect",
            OperationKind::Publish => "publish",
            OperationKind::Subscribe => "subscribe",
        };
        f.write_str(name)
    }
}

/// Session-assigned identifier for an accepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OperationId(u64);

impl OperationId {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) type OperationOutcome = Result<(), String>;

#[derive(Debug)]
pub(crate) struct PendingOperation {
    pub kind: OperationKind,
    pub generation: u64,
    /// Set once the transport accepted the request
    submitted: bool,
    /// Outcome that arrived before submission was confirmed
    settled: Option<OperationOutcome>,
    notify: oneshot::Sender<OperationOutcome>,
}

impl PendingOperation {
    /// Resolve the waiting token; a dropped token is not an error
    pub fn resolve(self, outcome: OperationOutcome) {
        let _ = self.notify.send(outcome);
    }
}

/// Result of routing an outcome to the registry
#[derive(Debug)]
pub(crate) enum Settlement {
    /// The operation is consumed and its notification must be delivered
    Dispatch(PendingOperation, OperationOutcome),
    /// Held until the submitting call confirms acceptance
    Deferred,
    /// Already consumed or never registered
    Unknown,
}

#[derive(Debug, Default)]
pub(crate) struct PendingOperations {
    next_id: u64,
    operations: HashMap<OperationId, PendingOperation>,
}

impl PendingOperations {
    pub fn register(&mut self, kind: OperationKind, generation: u64) -> OperationToken {
        self.next_id += 1;
        let id = OperationId(self.next_id);
        let (notify, outcome) = oneshot::channel();
        self.operations.insert(
            id,
            PendingOperation {
                kind,
                generation,
                submitted: false,
                settled: None,
                notify,
            },
        );
        OperationToken { id, kind, outcome }
    }

    /// Route an outcome; only the first outcome for an id counts
    pub fn settle(&mut self, id: OperationId, outcome: OperationOutcome) -> Settlement {
        match self.operations.get_mut(&id) {
            None => Settlement::Unknown,
            Some(op) if !op.submitted => {
                if op.settled.is_none() {
                    op.settled = Some(outcome);
                }
                Settlement::Deferred
            }
            Some(_) => match self.operations.remove(&id) {
                Some(op) => Settlement::Dispatch(op, outcome),
                None => Settlement::Unknown,
            },
        }
    }

    /// Confirm acceptance; returns the operation if its outcome already arrived
    pub fn mark_submitted(
        &mut self,
        id: OperationId,
    ) -> Option<(PendingOperation, OperationOutcome)> {
        let op = self.operations.get_mut(&id)?;
        op.submitted = true;
        if op.settled.is_none() {
            return None;
        }
        let mut op = self.operations.remove(&id)?;
        let outcome = op.settled.take()?;
        Some((op, outcome))
    }

    pub fn take(&mut self, id: OperationId) -> Option<PendingOperation> {
        self.operations.remove(&id)
    }

    /// Settle every operation of a session generation, oldest first.
    ///
    /// Submitted operations are removed and returned for dispatch. Operations
    /// still being submitted keep their record and receive the outcome once
    /// acceptance is confirmed.
    pub fn drain_generation<F>(
        &mut self,
        generation: u64,
        outcome_for: F,
    ) -> Vec<(OperationId, PendingOperation, OperationOutcome)>
    where
        F: Fn(OperationKind) -> OperationOutcome,
    {
        let mut ids: Vec<OperationId> = self
            .operations
            .iter()
            .filter(|(_, op)| op.generation == generation)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();

        let mut drained = Vec::new();
        for id in ids {
            let outcome = match self.operations.get(&id) {
                Some(op) => outcome_for(op.kind),
                None => continue,
            };
            if let Settlement::Dispatch(op, outcome) = self.settle(id, outcome) {
                drained.push((id, op, outcome));
            }
        }
        drained
    }

    pub fn outstanding(&self, kind: OperationKind) -> usize {
        self.operations.values().filter(|op| op.kind == kind).count()
    }
}

/// Handle returned for every accepted request.
///
/// The request runs to completion whether or not the token is awaited;
/// dropping it or abandoning a wait only stops observing the outcome.
#[derive(Debug)]
pub struct OperationToken {
    id: OperationId,
    kind: OperationKind,
    outcome: oneshot::Receiver<OperationOutcome>,
}

impl OperationToken {
    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Wait for the terminal notification of this request
    pub async fn wait(self) -> ClientResult<()> {
        let kind = self.kind;
        match self.outcome.await {
            Ok(outcome) => Self::into_result(kind, outcome),
            Err(_) => Err(ClientError::Abandoned { kind }),
        }
    }

    /// Wait at most `timeout`; expiry is reported as [`ClientError::Timeout`]
    pub async fn wait_timeout(self, timeout: Duration) -> ClientResult<()> {
        let kind = self.kind;
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout {
                kind,
                after: timeout,
            }),
        }
    }

    /// Outcome if the request already resolved
    pub fn try_outcome(&mut self) -> Option<ClientResult<()>> {
        match self.outcome.try_recv() {
            Ok(outcome) => Some(Self::into_result(self.kind, outcome)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(ClientError::Abandoned { kind: self.kind }))
            }
        }
    }

    fn into_result(kind: OperationKind, outcome: OperationOutcome) -> ClientResult<()> {
        outcome.map_err(|reason| ClientError::OperationFailed { kind, reason })
    }
}
