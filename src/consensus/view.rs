use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::watch;
use tracing::info;

use crate::{
    common::crypto::Pubkey,
    weights::{FaultMode, ReplicaId, WeightConfiguration, Weights},
};

/// Immutable description of the current view. Replaced as a whole on every
/// reconfiguration so readers never see a half-updated configuration.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    pub id: u64,
    pub me: ReplicaId,
    pub f: usize,
    pub delta: usize,
    pub mode: FaultMode,
    pub weights: WeightConfiguration,
    pub members: Vec<Pubkey>,
}

impl ViewSnapshot {
    pub fn n(&self) -> usize {
        self.members.len()
    }

    pub fn others(&self) -> Vec<ReplicaId> {
        (0..self.n()).filter(|&id| id != self.me).collect()
    }

    pub fn is_member(&self, replica: ReplicaId) -> bool {
        replica < self.n()
    }

    pub fn pubkey(&self, replica: ReplicaId) -> Option<&Pubkey> {
        self.members.get(replica)
    }

    pub fn weight_of(&self, replica: ReplicaId) -> f64 {
        Weights::new(self.mode, self.f, self.delta).weight_of(&self.weights, replica)
    }

    /// Vote weight needed for a WRITE or ACCEPT quorum.
    pub fn quorum(&self) -> f64 {
        Weights::new(self.mode, self.f, self.delta).quorum
    }
}

/// Membership/view management seam.
pub trait Membership: Send + Sync {
    fn snapshot(&self) -> Arc<ViewSnapshot>;

    /// Installs new weights through the deterministic view-update path.
    fn reconfigure(&self, weights: WeightConfiguration) -> Arc<ViewSnapshot>;
}

/// Leader-change / timeout sub-protocol seam.
pub trait LeaderChange: Send + Sync {
    fn current_leader(&self) -> ReplicaId;

    fn is_changing_leader(&self) -> bool;

    /// Suspects the current leader.
    fn trigger_timeout(&self);

    /// Asks the sub-protocol to install `leader`.
    fn request_leader(&self, leader: ReplicaId);
}

/// A fixed replica set whose weights can be reconfigured.
pub struct StaticView {
    snapshot: watch::Sender<Arc<ViewSnapshot>>,
}

impl StaticView {
    pub fn new(snapshot: ViewSnapshot) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(snapshot));
        StaticView { snapshot: tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ViewSnapshot>> {
        self.snapshot.subscribe()
    }
}

impl Membership for StaticView {
    fn snapshot(&self) -> Arc<ViewSnapshot> {
        self.snapshot.borrow().clone()
    }

    fn reconfigure(&self, weights: WeightConfiguration) -> Arc<ViewSnapshot> {
        let current = self.snapshot();
        let next = Arc::new(ViewSnapshot {
            id: current.id + 1,
            weights,
            ..(*current).clone()
        });
        info!(view = next.id, weights = %next.weights, "Installed new weight configuration");
        self.snapshot.send_replace(next.clone());
        next
    }
}

/// Round-robin leader by regency, as a stand-in for the real leader-change
/// sub-protocol: a timeout moves to the next replica, a request installs
/// the requested one.
#[derive(Debug)]
pub struct RotatingLeader {
    n: usize,
    regency: AtomicU64,
    leader: AtomicUsize,
}

impl RotatingLeader {
    pub fn new(n: usize, initial: ReplicaId) -> Self {
        RotatingLeader {
            n,
            regency: AtomicU64::new(0),
            leader: AtomicUsize::new(initial),
        }
    }

    pub fn regency(&self) -> u64 {
        self.regency.load(Ordering::Acquire)
    }
}

impl LeaderChange for RotatingLeader {
    fn current_leader(&self) -> ReplicaId {
        self.leader.load(Ordering::Acquire)
    }

    fn is_changing_leader(&self) -> bool {
        false
    }

    fn trigger_timeout(&self) {
        let regency = self.regency.fetch_add(1, Ordering::AcqRel) + 1;
        let next = (self.current_leader() + 1) % self.n;
        self.leader.store(next, Ordering::Release);
        info!(regency, leader = next, "Leader suspected, moved to next replica");
    }

    fn request_leader(&self, leader: ReplicaId) {
        let regency = self.regency.fetch_add(1, Ordering::AcqRel) + 1;
        self.leader.store(leader % self.n, Ordering::Release);
        info!(regency, leader, "Leader change requested");
    }
}
