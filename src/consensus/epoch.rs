use std::collections::{BTreeMap, HashMap};

use crate::{
    common::crypto::Digest,
    weights::{quorum_reached, ReplicaId},
};

use super::proof::PendingProof;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Phase {
    Init,
    Proposed,
    WriteSent,
    AcceptSent,
    Decided,
}

/// Weighted votes of one message class. Each replica counts once: later
/// votes from the same sender are ignored, whatever value they name.
#[derive(Debug, Default)]
pub struct Tally {
    voters: HashMap<ReplicaId, Digest>,
    weights: HashMap<Digest, f64>,
}

impl Tally {
    /// Returns false if `sender` already voted in this tally.
    pub fn add(&mut self, sender: ReplicaId, hash: Digest, weight: f64) -> bool {
        if self.voters.contains_key(&sender) {
            return false;
        }
        self.voters.insert(sender, hash);
        *self.weights.entry(hash).or_insert(0.0) += weight;
        true
    }

    pub fn weight(&self, hash: &Digest) -> f64 {
        self.weights.get(hash).copied().unwrap_or(0.0)
    }

    pub fn has_voted(&self, sender: ReplicaId) -> bool {
        self.voters.contains_key(&sender)
    }

    pub fn reached(&self, hash: &Digest, quorum: f64, epsilon: f64) -> bool {
        quorum_reached(self.weight(hash), quorum, epsilon)
    }

    pub fn voters(&self) -> usize {
        self.voters.len()
    }
}

/// One attempt at deciding an instance, led by one leader.
#[derive(Debug)]
pub struct Epoch {
    pub timestamp: u32,
    pub phase: Phase,
    pub proposer: Option<ReplicaId>,
    pub proposed_value: Option<Vec<u8>>,
    pub proposed_hash: Option<Digest>,
    pub write_tally: Tally,
    pub accept_tally: Tally,
    /// ACCEPT being proven in the background, for the hash it names.
    pub speculative_accept: Option<(Digest, PendingProof)>,
}

impl Epoch {
    pub fn new(timestamp: u32) -> Self {
        Epoch {
            timestamp,
            phase: Phase::Init,
            proposer: None,
            proposed_value: None,
            proposed_hash: None,
            write_tally: Tally::default(),
            accept_tally: Tally::default(),
            speculative_accept: None,
        }
    }

    pub fn is_proposed(&self) -> bool {
        self.proposed_hash.is_some()
    }

    /// Moves forward only; a late event never rewinds the phase.
    pub fn advance(&mut self, phase: Phase) {
        if phase > self.phase {
            self.phase = phase;
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Decision {
    pub cid: u64,
    pub epoch: u32,
    pub value: Vec<u8>,
    pub value_hash: Digest,
}

#[derive(Debug)]
pub struct ConsensusInstance {
    pub cid: u64,
    /// Timestamp of the epoch currently being executed.
    pub ets: u32,
    pub epochs: BTreeMap<u32, Epoch>,
    pub decision: Option<Decision>,
}

impl ConsensusInstance {
    pub fn new(cid: u64) -> Self {
        let mut epochs = BTreeMap::new();
        epochs.insert(0, Epoch::new(0));
        ConsensusInstance {
            cid,
            ets: 0,
            epochs,
            decision: None,
        }
    }

    pub fn epoch_mut(&mut self, timestamp: u32) -> &mut Epoch {
        self.epochs.entry(timestamp).or_insert_with(|| Epoch::new(timestamp))
    }

    pub fn epoch(&self, timestamp: u32) -> Option<&Epoch> {
        self.epochs.get(&timestamp)
    }

    pub fn is_decided(&self) -> bool {
        self.decision.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_counts_each_sender_once() {
        let a = [1u8; 64];
        let b = [2u8; 64];
        let mut tally = Tally::default();

        assert!(tally.add(0, a, 2.0));
        assert!(tally.add(1, a, 1.0));
        assert!(!tally.add(1, a, 1.0));
        assert!(!tally.add(0, b, 2.0));
        assert!(tally.add(2, b, 1.0));

        assert_eq!(tally.weight(&a), 3.0);
        assert_eq!(tally.weight(&b), 1.0);
        assert_eq!(tally.voters(), 3);
        assert!(tally.has_voted(2));
    }

    #[test]
    fn test_tally_quorum_uses_epsilon() {
        let hash = [9u8; 64];
        let mut tally = Tally::default();
        for (sender, weight) in [(0, 2.0), (1, 2.0), (2, 1.0)] {
            tally.add(sender, hash, weight);
        }
        assert!(tally.reached(&hash, 5.0, -1e-10));
        assert!(!tally.reached(&hash, 5.0 + 1e-9, -1e-10));
        assert!(!tally.reached(&[0u8; 64], 5.0, -1e-10));
    }

    #[test]
    fn test_phase_never_rewinds() {
        let mut epoch = Epoch::new(0);
        epoch.advance(Phase::AcceptSent);
        epoch.advance(Phase::WriteSent);
        assert_eq!(epoch.phase, Phase::AcceptSent);
    }

    #[test]
    fn test_instance_starts_in_epoch_zero() {
        let mut instance = ConsensusInstance::new(4);
        assert_eq!(instance.epoch(0).map(|e| e.phase), Some(Phase::Init));
        assert!(instance.epoch(2).is_none());
        assert_eq!(instance.epoch_mut(2).timestamp, 2);
        assert!(!instance.is_decided());
    }
}
