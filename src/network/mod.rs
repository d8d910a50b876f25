pub mod node;

pub use node::*;

use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::{
    consensus::{ConsensusMessage, Decision},
    weights::ReplicaId,
};

/*
    Links are point-to-point, authenticated and reliable: a correct replica
    receives a message from another correct replica if and only if the
    latter sent it. Nothing is assumed about timing for safety; the latency
    optimizer only shifts which replicas the quorums wait for.

    The consensus core calls out through the traits below and never owns a
    socket. Senders are synchronous and must not block: implementations
    queue the message and return.
*/

pub trait Transport: Send + Sync {
    fn send(&self, targets: &[ReplicaId], message: ConsensusMessage);
}

/// Totally ordered dissemination, used for latency measurements.
pub trait OrderedBroadcast: Send + Sync {
    fn order(&self, payload: Vec<u8>);
}

/// The execution layer decided values are handed to.
pub trait Executor: Send + Sync {
    fn deliver(&self, decision: Decision);
}

/// Deserialization and validation of proposed values.
pub trait ValueValidator: Send + Sync {
    fn validate(&self, value: &[u8]) -> bool;
}

impl<F> ValueValidator for F
where
    F: Fn(&[u8]) -> bool + Send + Sync,
{
    fn validate(&self, value: &[u8]) -> bool {
        self(value)
    }
}

impl Executor for UnboundedSender<Decision> {
    fn deliver(&self, decision: Decision) {
        if self.send(decision).is_err() {
            warn!("Execution layer is gone, dropping decision");
        }
    }
}

impl OrderedBroadcast for UnboundedSender<Vec<u8>> {
    fn order(&self, payload: Vec<u8>) {
        if self.send(payload).is_err() {
            warn!("Ordered broadcast is gone, dropping payload");
        }
    }
}

/// In-process transport over tokio channels.
#[derive(Clone, Default)]
pub struct ChannelTransport {
    peers: HashMap<ReplicaId, UnboundedSender<ConsensusMessage>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, replica: ReplicaId, inbox: UnboundedSender<ConsensusMessage>) {
        self.peers.insert(replica, inbox);
    }
}

impl Transport for ChannelTransport {
    fn send(&self, targets: &[ReplicaId], message: ConsensusMessage) {
        for target in targets {
            match self.peers.get(target) {
                Some(inbox) => {
                    if inbox.send(message.clone()).is_err() {
                        warn!(target, "Replica inbox closed");
                    }
                }
                None => warn!(target, "No link to replica"),
            }
        }
    }
}
