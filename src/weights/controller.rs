use std::{
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use tokio::{
    runtime::{Handle, RuntimeFlavor},
    sync::watch,
    task,
};
use tracing::{debug, info, warn};

use super::{
    configuration::{CandidateConfiguration, ReplicaId, WeightConfiguration},
    monitor::Monitor,
    optimizer::{ConfigurationOptimizer, SearchOutcome},
};
use crate::{
    common::lock,
    consensus::view::{LeaderChange, Membership},
};

/*
    Every `interval` decided instances a search for the best configuration
    starts in the background over the matrices as they stand at that cid.
    `delay` instances later the result is read back and applied if it is
    worth it. All correct replicas decide the same cids in the same order and
    apply the same totally ordered measurements, so they start the same
    search with the same seed and reach the same decision without an extra
    agreement round.
*/

#[derive(Clone, Debug)]
pub struct ControllerSettings {
    pub enabled: bool,
    pub interval: u64,
    pub delay: u64,
    /// Required speed-up factor before switching; above 1 to avoid thrashing.
    pub optimization_goal: f64,
    pub leader_selection: bool,
    /// Longest the protocol thread waits for an unfinished search.
    pub apply_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        ControllerSettings {
            enabled: true,
            interval: 100,
            delay: 50,
            optimization_goal: 1.1,
            leader_selection: true,
            apply_timeout: Duration::from_secs(2),
        }
    }
}

/// What an apply point changed.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ReconfigurationDecision {
    pub cid: u64,
    pub weights: Option<WeightConfiguration>,
    pub leader: Option<ReplicaId>,
}

/// Published after every apply point.
#[derive(Clone, Debug, Default)]
pub struct ControllerState {
    pub active: Option<CandidateConfiguration>,
    pub best: Option<CandidateConfiguration>,
    pub last_search: Option<u64>,
    pub last_decision: Option<ReconfigurationDecision>,
}

#[derive(Default)]
struct SearchSlot {
    pending: Option<u64>,
    result: Option<(u64, SearchOutcome)>,
}

pub struct ReconfigurationController {
    settings: ControllerSettings,
    optimizer: Arc<ConfigurationOptimizer>,
    monitor: Arc<Monitor>,
    membership: Arc<dyn Membership>,
    leader_change: Arc<dyn LeaderChange>,
    search: Arc<(Mutex<SearchSlot>, Condvar)>,
    state: watch::Sender<Arc<ControllerState>>,
}

impl ReconfigurationController {
    pub fn new(
        settings: ControllerSettings,
        optimizer: Arc<ConfigurationOptimizer>,
        monitor: Arc<Monitor>,
        membership: Arc<dyn Membership>,
        leader_change: Arc<dyn LeaderChange>,
    ) -> Self {
        let (state, _rx) = watch::channel(Arc::new(ControllerState::default()));
        ReconfigurationController {
            settings,
            optimizer,
            monitor,
            membership,
            leader_change,
            search: Arc::new((Mutex::new(SearchSlot::default()), Condvar::new())),
            state,
        }
    }

    pub fn state(&self) -> Arc<ControllerState> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ControllerState>> {
        self.state.subscribe()
    }

    /// Hook run once per decided instance. Must be called from within a
    /// tokio runtime; the search runs on the blocking pool.
    pub fn optimize(&self, cid: u64) -> Option<ReconfigurationDecision> {
        let ControllerSettings {
            enabled,
            interval,
            delay,
            ..
        } = self.settings;
        if !enabled || cid == 0 || interval == 0 {
            return None;
        }

        if cid % interval == 0 {
            self.start_search(cid);
        }
        if cid % interval == delay && cid >= interval + delay {
            return self.apply(cid);
        }
        None
    }

    fn start_search(&self, cid: u64) {
        let view = self.membership.snapshot();
        let leader = self.leader_change.current_leader();
        let (propose, write) = self.monitor.matrices();

        {
            let mut slot = lock(&self.search.0);
            if let Some(previous) = slot.pending.replace(cid) {
                debug!(previous, cid, "Superseding unfinished configuration search");
            }
            slot.result = None;
        }

        info!(cid, "Started computation of best configuration in background");
        let optimizer = Arc::clone(&self.optimizer);
        let search = Arc::clone(&self.search);
        tokio::task::spawn_blocking(move || {
            let outcome = optimizer.compute_best(&propose, &write, &view.weights, leader, cid);

            let (slot, completed) = &*search;
            let mut slot = lock(slot);
            if slot.pending == Some(cid) {
                slot.pending = None;
                slot.result = Some((cid, outcome));
            } else {
                debug!(cid, "Discarding result of superseded search");
            }
            completed.notify_all();
        });
    }

    /// Blocks until the pending search finishes or `apply_timeout` passes.
    fn await_result(&self, cid: u64) -> Option<(u64, SearchOutcome)> {
        let wait = || {
            let (slot, completed) = &*self.search;
            let (mut slot, wait) = completed
                .wait_timeout_while(lock(slot), self.settings.apply_timeout, |s| s.pending.is_some())
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if wait.timed_out() && slot.pending.is_some() {
                warn!(cid, "Configuration search not finished in time, keeping current configuration");
                return None;
            }
            slot.result.take()
        };
        // Hand this worker's other tasks to the rest of the pool meanwhile.
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => task::block_in_place(wait),
            _ => wait(),
        }
    }

    fn apply(&self, cid: u64) -> Option<ReconfigurationDecision> {
        let (search_cid, outcome) = self.await_result(cid)?;
        // The next search starts from fresh measurements.
        self.monitor.reset_matrices();

        let view = self.membership.snapshot();
        let leader = self.leader_change.current_leader();
        let SearchOutcome { current, search } = outcome;
        let best = search.best;

        let worthwhile =
            current.predicted_latency as f64 >= best.predicted_latency as f64 * self.settings.optimization_goal;
        info!(
            cid,
            search_cid,
            current = current.predicted_latency,
            best = best.predicted_latency,
            "Comparing current configuration against pre-computed best"
        );

        let mut decision = ReconfigurationDecision {
            cid,
            weights: None,
            leader: None,
        };

        if worthwhile && best.weights != view.weights {
            self.membership.reconfigure(best.weights.clone());
            info!(cid, weights = %best.weights, "[X] Optimization: weight adjustment");
            decision.weights = Some(best.weights.clone());
        } else {
            info!(cid, "[ ] Optimization: no weight adjustment");
        }

        if self.settings.leader_selection && worthwhile && best.leader != leader {
            self.leader_change.request_leader(best.leader);
            info!(cid, leader = best.leader, "[X] Optimization: leader selection");
            decision.leader = Some(best.leader);
        } else {
            info!(cid, leader, "[ ] Optimization: no leader change");
        }

        let changed = decision.weights.is_some() || decision.leader.is_some();
        let active = if changed { best.clone() } else { current };
        self.state.send_replace(Arc::new(ControllerState {
            active: Some(active),
            best: Some(best),
            last_search: Some(search_cid),
            last_decision: changed.then(|| decision.clone()),
        }));

        changed.then_some(decision)
    }
}
