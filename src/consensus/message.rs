use sha2::{Digest as ShaDigest, Sha512};

use crate::{
    common::crypto::{Digest, Proof},
    weights::ReplicaId,
};

/*
    The leader of an epoch sends PROPOSE carrying the value. In Byzantine
    mode every replica answers with a WRITE for the value's hash and, once a
    weighted quorum of WRITEs agrees, with an ACCEPT for the same hash. A
    weighted quorum of ACCEPTs decides the value. In crash-fault mode the
    WRITE round is skipped. Only ACCEPT carries a proof: it is the message
    other replicas may later present as evidence of the decision.

    DUMMY_PROPOSE and PROPOSE_RESPONSE never touch an instance. A replica
    that is not leading echoes the leader's value to everyone as a dummy
    proposal and times the responses, which gives it its own row of PROPOSE
    latencies.
*/

pub trait Hashable {
    fn hash(&self) -> Digest;
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MessageKind {
    Propose,
    Write,
    Accept,
    DummyPropose,
    ProposeResponse,
}

impl AsRef<[u8]> for MessageKind {
    fn as_ref(&self) -> &[u8] {
        match self {
            MessageKind::Propose => &[1u8],
            MessageKind::Write => &[2u8],
            MessageKind::Accept => &[3u8],
            MessageKind::DummyPropose => &[4u8],
            MessageKind::ProposeResponse => &[5u8],
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ConsensusMessage {
    pub kind: MessageKind,
    pub cid: u64,
    pub epoch: u32,
    pub sender: ReplicaId,
    /// The proposed value; empty on everything but PROPOSE and DUMMY_PROPOSE.
    pub value: Vec<u8>,
    pub value_hash: Digest,
    pub proof: Option<Proof>,
}

impl ConsensusMessage {
    pub fn propose(cid: u64, epoch: u32, sender: ReplicaId, value: Vec<u8>) -> Self {
        ConsensusMessage {
            kind: MessageKind::Propose,
            cid,
            epoch,
            sender,
            value_hash: value_digest(&value),
            value,
            proof: None,
        }
    }

    /// Carries a real value so the probe costs what a PROPOSE costs.
    pub fn dummy_propose(cid: u64, sender: ReplicaId, value: Vec<u8>) -> Self {
        ConsensusMessage {
            kind: MessageKind::DummyPropose,
            ..Self::propose(cid, 0, sender, value)
        }
    }

    pub fn propose_response(cid: u64, sender: ReplicaId, value_hash: Digest) -> Self {
        Self::vote(MessageKind::ProposeResponse, cid, 0, sender, value_hash)
    }

    pub fn write(cid: u64, epoch: u32, sender: ReplicaId, value_hash: Digest) -> Self {
        Self::vote(MessageKind::Write, cid, epoch, sender, value_hash)
    }

    pub fn accept(cid: u64, epoch: u32, sender: ReplicaId, value_hash: Digest) -> Self {
        Self::vote(MessageKind::Accept, cid, epoch, sender, value_hash)
    }

    fn vote(kind: MessageKind, cid: u64, epoch: u32, sender: ReplicaId, value_hash: Digest) -> Self {
        ConsensusMessage {
            kind,
            cid,
            epoch,
            sender,
            value: Vec::new(),
            value_hash,
            proof: None,
        }
    }

    /// A PROPOSE whose hash does not match its value was tampered with.
    pub fn is_consistent(&self) -> bool {
        match self.kind {
            MessageKind::Propose | MessageKind::DummyPropose => value_digest(&self.value) == self.value_hash,
            MessageKind::Write | MessageKind::Accept | MessageKind::ProposeResponse => self.value.is_empty(),
        }
    }

    /// Latency probes, handled outside the consensus instances.
    pub fn is_probe(&self) -> bool {
        matches!(self.kind, MessageKind::DummyPropose | MessageKind::ProposeResponse)
    }
}

/// Covers everything but the proof itself.
impl Hashable for ConsensusMessage {
    fn hash(&self) -> Digest {
        let mut hasher = Sha512::new();
        hasher.update(self.kind.as_ref());
        hasher.update(self.cid.to_be_bytes());
        hasher.update(self.epoch.to_be_bytes());
        hasher.update((self.sender as u64).to_be_bytes());
        hasher.update(self.value_hash);
        finalize(hasher)
    }
}

pub fn value_digest(value: &[u8]) -> Digest {
    let mut hasher = Sha512::new();
    hasher.update(value);
    finalize(hasher)
}

fn finalize(hasher: Sha512) -> Digest {
    let result = hasher.finalize();
    let mut digest = [0u8; 64];
    digest.copy_from_slice(&result[..]);
    digest
}
