use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Instant,
};

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, trace, warn};

use super::{
    epoch::{ConsensusInstance, Decision, Epoch, Phase},
    message::{ConsensusMessage, MessageKind},
    proof::{PendingProof, ProofPool},
    store::DecisionStore,
    view::{LeaderChange, Membership, ViewSnapshot},
};
use crate::{
    common::{crypto::Digest, lock},
    network::{Executor, Transport, ValueValidator},
    weights::{Monitor, ReconfigurationController, ReplicaId},
};

/*
    Each instance (cid) is driven through INIT -> PROPOSED -> WRITE_SENT ->
    ACCEPT_SENT -> DECIDED under its own lock, so distinct instances can be
    in flight at once. Quorums are weighted: a replica in R_max counts V_max,
    one in R_min counts V_min, and a value needs a tally above the view's
    quorum weight (minus a small epsilon for rounding).

    The ACCEPT proof is built in the background as soon as there is a value
    to speculate on. Only the final send waits for it.

    Messages more than `max_in_flight` instances past the last decision are
    dropped before they allocate anything, and at most one early PROPOSE is
    kept per replica.
*/

#[derive(Clone, Copy, Debug)]
pub struct AcceptorSettings {
    pub quorum_epsilon: f64,
    /// Decided instances kept behind the newest decision.
    pub gc_delay: u64,
    pub max_in_flight: u64,
}

impl Default for AcceptorSettings {
    fn default() -> Self {
        AcceptorSettings {
            quorum_epsilon: -1e-10,
            gc_delay: 100,
            max_in_flight: 1000,
        }
    }
}

/// External collaborators the acceptor calls into.
pub struct AcceptorContext {
    pub membership: Arc<dyn Membership>,
    pub leader_change: Arc<dyn LeaderChange>,
    pub transport: Arc<dyn Transport>,
    pub validator: Arc<dyn ValueValidator>,
    pub executor: Arc<dyn Executor>,
}

pub struct Acceptor {
    me: ReplicaId,
    epsilon: f64,
    max_in_flight: u64,
    context: AcceptorContext,
    proofs: ProofPool,
    monitor: Option<Arc<Monitor>>,
    controller: Option<Arc<ReconfigurationController>>,
    instances: Mutex<HashMap<u64, Arc<Mutex<ConsensusInstance>>>>,
    decisions: Mutex<DecisionStore>,
    /// Latest proposal from each replica that was not leader when it arrived.
    buffered: Mutex<HashMap<ReplicaId, ConsensusMessage>>,
    started: Instant,
}

impl Acceptor {
    pub fn new(proofs: ProofPool, context: AcceptorContext, settings: AcceptorSettings) -> Self {
        Acceptor {
            me: proofs.authenticator().me(),
            epsilon: settings.quorum_epsilon,
            max_in_flight: settings.max_in_flight,
            context,
            proofs,
            monitor: None,
            controller: None,
            instances: Mutex::new(HashMap::new()),
            decisions: Mutex::new(DecisionStore::new(settings.gc_delay)),
            buffered: Mutex::new(HashMap::new()),
            started: Instant::now(),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_controller(mut self, controller: Arc<ReconfigurationController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn me(&self) -> ReplicaId {
        self.me
    }

    pub async fn run(&self, mut inbox: UnboundedReceiver<ConsensusMessage>) {
        info!(me = self.me, "Running acceptor");
        while let Some(message) = inbox.recv().await {
            self.deliver(message);
        }
        info!(me = self.me, "Inbox closed, acceptor stopped");
    }

    /// Starts instance `cid` with `value`. Only the current leader proposes.
    pub fn propose(&self, cid: u64, value: Vec<u8>) {
        let view = self.context.membership.snapshot();
        let leader = self.context.leader_change.current_leader();
        if leader != self.me {
            warn!(cid, leader, "Not the leader, refusing to propose");
            return;
        }

        let propose = ConsensusMessage::propose(cid, 0, self.me, value);
        let others = view.others();
        if let Some(monitor) = &self.monitor {
            let now = self.now();
            for &to in &others {
                monitor.propose_sent(to, cid, now);
            }
        }
        debug!(cid, "Broadcasting PROPOSE");
        self.context.transport.send(&others, propose.clone());
        self.process_message(&view, propose);
    }

    /// Entry point for messages from the network.
    pub fn deliver(&self, message: ConsensusMessage) {
        let view = self.context.membership.snapshot();
        let ConsensusMessage { kind, cid, sender, .. } = message;

        if !view.is_member(sender) {
            warn!(cid, sender, "Discarding message from unknown replica");
            return;
        }
        if !message.is_consistent() {
            warn!(cid, sender, ?kind, "Discarding malformed message");
            return;
        }
        let horizon = lock(&self.decisions)
            .last_decided()
            .unwrap_or(0)
            .saturating_add(self.max_in_flight);
        if cid > horizon {
            warn!(cid, sender, horizon, ?kind, "Discarding message too far ahead of the last decision");
            return;
        }
        if message.is_probe() {
            self.on_probe(message);
            return;
        }
        if kind == MessageKind::Accept {
            let verified = view
                .pubkey(sender)
                .is_some_and(|signer| self.proofs.verify(&message, signer));
            if !verified {
                warn!(cid, sender, "Discarding ACCEPT with invalid proof");
                return;
            }
        }
        self.process_message(&view, message);
    }

    fn process_message(&self, view: &ViewSnapshot, message: ConsensusMessage) {
        let cid = message.cid;
        if cid < lock(&self.decisions).low_watermark() {
            trace!(cid, "Ignoring message for collected instance");
            return;
        }

        let instance = self.instance(cid);
        let decision = {
            let mut instance = lock(&instance);
            if instance.is_decided() {
                trace!(cid, kind = ?message.kind, "Instance already decided");
                return;
            }
            let decision = match message.kind {
                MessageKind::Propose => self.on_propose(&mut instance, view, message),
                MessageKind::Write => self.on_write(&mut instance, view, message),
                MessageKind::Accept => self.on_accept(&mut instance, view, message),
                MessageKind::DummyPropose | MessageKind::ProposeResponse => None,
            };
            if let Some(decision) = &decision {
                instance.decision = Some(decision.clone());
            }
            decision
        };

        if let Some(decision) = decision {
            self.decide(decision);
        }
    }

    fn on_propose(
        &self,
        instance: &mut ConsensusInstance,
        view: &ViewSnapshot,
        message: ConsensusMessage,
    ) -> Option<Decision> {
        let cid = instance.cid;
        let sender = message.sender;
        let leader = self.context.leader_change.current_leader();

        if sender != leader {
            debug!(cid, sender, leader, "Buffering PROPOSE from replica that is not leader");
            lock(&self.buffered).insert(sender, message);
            return None;
        }
        if message.epoch != 0 || instance.ets != 0 {
            debug!(cid, epoch = message.epoch, ets = instance.ets, "Ignoring PROPOSE outside epoch 0");
            return None;
        }

        let epoch = instance.epoch_mut(0);
        if epoch.is_proposed() {
            debug!(cid, sender, "Ignoring duplicate PROPOSE");
            return None;
        }
        if !self.context.validator.validate(&message.value) {
            warn!(cid, sender, "Proposed value is invalid, suspecting leader");
            if !self.context.leader_change.is_changing_leader() {
                self.context.leader_change.trigger_timeout();
            }
            return None;
        }

        let hash = message.value_hash;
        if sender != self.me {
            self.probe_propose(cid, view, &message.value);
        }
        epoch.proposer = Some(sender);
        epoch.proposed_value = Some(message.value);
        epoch.proposed_hash = Some(hash);
        epoch.advance(Phase::Proposed);
        debug!(cid, sender, "Accepted PROPOSE");

        if view.mode.is_bft() {
            if epoch.speculative_accept.is_none() {
                epoch.speculative_accept = Some((hash, self.prove_accept(cid, epoch.timestamp, hash, view)));
            }
            epoch.write_tally.add(self.me, hash, view.weight_of(self.me));
            let others = view.others();
            if let Some(monitor) = &self.monitor {
                let now = self.now();
                for &to in &others {
                    monitor.write_sent(to, cid, now);
                }
            }
            self.context
                .transport
                .send(&others, ConsensusMessage::write(cid, epoch.timestamp, self.me, hash));
            epoch.advance(Phase::WriteSent);
            trace!(cid, "Sent WRITE");
            self.compute_write(cid, epoch, view)
        } else {
            self.send_accept(cid, epoch, view, hash);
            self.compute_accept(cid, epoch, view)
        }
    }

    /// Echoes the leader's value to everyone as a dummy PROPOSE, timed like a
    /// real one.
    fn probe_propose(&self, cid: u64, view: &ViewSnapshot, value: &[u8]) {
        let Some(monitor) = self.monitor.as_ref().filter(|monitor| monitor.should_probe(cid)) else {
            return;
        };
        let others = view.others();
        let now = self.now();
        for &to in &others {
            monitor.propose_sent(to, cid, now);
        }
        trace!(cid, "Sent DUMMY_PROPOSE");
        self.context
            .transport
            .send(&others, ConsensusMessage::dummy_propose(cid, self.me, value.to_vec()));
    }

    fn on_probe(&self, message: ConsensusMessage) {
        let ConsensusMessage {
            kind,
            cid,
            sender,
            value_hash,
            ..
        } = message;
        match kind {
            MessageKind::DummyPropose => {
                self.context
                    .transport
                    .send(&[sender], ConsensusMessage::propose_response(cid, self.me, value_hash));
            }
            MessageKind::ProposeResponse => {
                if let Some(monitor) = &self.monitor {
                    monitor.propose_echoed(sender, cid, self.now());
                }
            }
            MessageKind::Propose | MessageKind::Write | MessageKind::Accept => {}
        }
    }

    fn on_write(
        &self,
        instance: &mut ConsensusInstance,
        view: &ViewSnapshot,
        message: ConsensusMessage,
    ) -> Option<Decision> {
        let cid = instance.cid;
        let sender = message.sender;
        if !view.mode.is_bft() {
            warn!(cid, sender, "Unexpected WRITE in crash-fault mode");
            return None;
        }

        let epoch = instance.epoch_mut(message.epoch);
        if let Some(monitor) = &self.monitor {
            let now = self.now();
            monitor.write_echoed(sender, cid, now);
            if epoch.proposer == Some(self.me) {
                monitor.propose_echoed(sender, cid, now);
            }
        }

        if !epoch.write_tally.add(sender, message.value_hash, view.weight_of(sender)) {
            debug!(cid, sender, "Ignoring second WRITE from replica");
            return None;
        }
        // Speculate on the first value seen, even before the PROPOSE.
        if epoch.speculative_accept.is_none() {
            let hash = message.value_hash;
            epoch.speculative_accept = Some((hash, self.prove_accept(cid, epoch.timestamp, hash, view)));
        }
        self.compute_write(cid, epoch, view)
    }

    fn on_accept(
        &self,
        instance: &mut ConsensusInstance,
        view: &ViewSnapshot,
        message: ConsensusMessage,
    ) -> Option<Decision> {
        let cid = instance.cid;
        let sender = message.sender;
        let epoch = instance.epoch_mut(message.epoch);
        if !epoch.accept_tally.add(sender, message.value_hash, view.weight_of(sender)) {
            debug!(cid, sender, "Ignoring second ACCEPT from replica");
            return None;
        }
        self.compute_accept(cid, epoch, view)
    }

    fn compute_write(&self, cid: u64, epoch: &mut Epoch, view: &ViewSnapshot) -> Option<Decision> {
        let hash = epoch.proposed_hash?;
        if epoch.phase >= Phase::AcceptSent || !epoch.write_tally.reached(&hash, view.quorum(), self.epsilon) {
            return None;
        }
        debug!(
            cid,
            epoch = epoch.timestamp,
            weight = epoch.write_tally.weight(&hash),
            "WRITE quorum reached"
        );
        self.send_accept(cid, epoch, view, hash);
        self.compute_accept(cid, epoch, view)
    }

    fn compute_accept(&self, cid: u64, epoch: &mut Epoch, view: &ViewSnapshot) -> Option<Decision> {
        let hash = epoch.proposed_hash?;
        if !epoch.accept_tally.reached(&hash, view.quorum(), self.epsilon) {
            return None;
        }
        let value = epoch.proposed_value.clone()?;
        epoch.advance(Phase::Decided);
        debug!(cid, epoch = epoch.timestamp, "ACCEPT quorum reached");
        Some(Decision {
            cid,
            epoch: epoch.timestamp,
            value,
            value_hash: hash,
        })
    }

    fn prove_accept(&self, cid: u64, epoch: u32, hash: Digest, view: &ViewSnapshot) -> PendingProof {
        self.proofs
            .spawn(ConsensusMessage::accept(cid, epoch, self.me, hash), view.others())
    }

    /// Counts our own ACCEPT and sends it once its proof is ready.
    fn send_accept(&self, cid: u64, epoch: &mut Epoch, view: &ViewSnapshot, hash: Digest) {
        let pending = match epoch.speculative_accept.take() {
            Some((speculated, pending)) if speculated == hash => pending,
            Some((_, stale)) => {
                warn!(cid, "Speculative ACCEPT was for another value, regenerating");
                stale.abort();
                self.prove_accept(cid, epoch.timestamp, hash, view)
            }
            None => self.prove_accept(cid, epoch.timestamp, hash, view),
        };
        epoch.accept_tally.add(self.me, hash, view.weight_of(self.me));
        epoch.advance(Phase::AcceptSent);

        let transport = Arc::clone(&self.context.transport);
        let targets = view.others();
        tokio::spawn(async move {
            match pending.await {
                Ok(Ok(accept)) => {
                    trace!(cid, "Sent ACCEPT");
                    transport.send(&targets, accept);
                }
                Ok(Err(e)) => warn!(cid, error = %e, "Failed to prove ACCEPT"),
                Err(e) => warn!(cid, error = %e, "ACCEPT proof task failed"),
            }
        });
    }

    fn decide(&self, decision: Decision) {
        let cid = decision.cid;
        info!(cid, epoch = decision.epoch, "Decided instance");

        let low = {
            let mut decisions = lock(&self.decisions);
            decisions.archive(decision.clone());
            decisions.collect_garbage()
        };
        lock(&self.instances).retain(|&id, _| id >= low);
        lock(&self.buffered).retain(|_, proposal| proposal.cid > cid);

        self.context.executor.deliver(decision);

        let Some(controller) = &self.controller else {
            return;
        };
        if let Some(leader) = controller.optimize(cid).and_then(|reconfiguration| reconfiguration.leader) {
            self.leader_installed(leader);
        }
    }

    /// Replays the proposal buffered from `leader` now that it leads.
    pub fn leader_installed(&self, leader: ReplicaId) {
        let Some(proposal) = lock(&self.buffered).remove(&leader) else {
            return;
        };
        let view = self.context.membership.snapshot();
        debug!(cid = proposal.cid, leader, "Replaying buffered PROPOSE");
        self.process_message(&view, proposal);
    }

    fn instance(&self, cid: u64) -> Arc<Mutex<ConsensusInstance>> {
        Arc::clone(
            lock(&self.instances)
                .entry(cid)
                .or_insert_with(|| Arc::new(Mutex::new(ConsensusInstance::new(cid)))),
        )
    }

    pub fn phase(&self, cid: u64) -> Option<Phase> {
        let instance = lock(&self.instances).get(&cid).cloned()?;
        let instance = lock(&instance);
        instance.epoch(instance.ets).map(|epoch| epoch.phase)
    }

    pub fn decision(&self, cid: u64) -> Option<Decision> {
        lock(&self.decisions).get(cid).cloned()
    }

    fn now(&self) -> i64 {
        i64::try_from(self.started.elapsed().as_micros()).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        common::crypto::{Authenticator, Keypair, ProofScheme},
        consensus::{
            message::value_digest,
            view::{RotatingLeader, StaticView},
        },
        weights::{FaultMode, WeightConfiguration, MISSING},
    };

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(Vec<ReplicaId>, ConsensusMessage)>>,
    }

    impl RecordingTransport {
        fn sent(&self, kind: MessageKind) -> Vec<ConsensusMessage> {
            lock(&self.sent)
                .iter()
                .filter(|(_, message)| message.kind == kind)
                .map(|(_, message)| message.clone())
                .collect()
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, targets: &[ReplicaId], message: ConsensusMessage) {
            lock(&self.sent).push((targets.to_vec(), message));
        }
    }

    fn keypair(id: ReplicaId) -> Keypair {
        Keypair::from_seed([id as u8 + 1; 32])
    }

    struct Harness {
        acceptor: Acceptor,
        transport: Arc<RecordingTransport>,
        leader: Arc<RotatingLeader>,
        decisions: mpsc::UnboundedReceiver<Decision>,
    }

    // n = 4, f = 1, delta = 0: every weight is 1 and the quorum is 3.
    fn harness(me: ReplicaId, validator: Arc<dyn ValueValidator>) -> Harness {
        let replicas = [0, 1, 2, 3];
        let view = Arc::new(StaticView::new(ViewSnapshot {
            id: 0,
            me,
            f: 1,
            delta: 0,
            mode: FaultMode::Byzantine,
            weights: WeightConfiguration::from_permutation(2, &replicas),
            members: replicas.iter().map(|&id| keypair(id).pubkey()).collect(),
        }));
        let leader = Arc::new(RotatingLeader::new(4, 0));
        let transport = Arc::new(RecordingTransport::default());
        let (executor, decisions) = mpsc::unbounded_channel();
        let authenticator = Authenticator::new(me, keypair(me), ProofScheme::Signature, 0, Duration::ZERO);

        let acceptor = Acceptor::new(
            ProofPool::new(Arc::new(authenticator), 2),
            AcceptorContext {
                membership: view,
                leader_change: leader.clone(),
                transport: transport.clone(),
                validator,
                executor: Arc::new(executor),
            },
            AcceptorSettings {
                gc_delay: 10,
                max_in_flight: 50,
                ..AcceptorSettings::default()
            },
        );
        Harness {
            acceptor,
            transport,
            leader,
            decisions,
        }
    }

    fn accept_all() -> Arc<dyn ValueValidator> {
        Arc::new(|_: &[u8]| true)
    }

    async fn signed_accept(from: ReplicaId, cid: u64, hash: Digest) -> ConsensusMessage {
        let authenticator = Authenticator::new(from, keypair(from), ProofScheme::Signature, 0, Duration::ZERO);
        ProofPool::new(Arc::new(authenticator), 1)
            .spawn(ConsensusMessage::accept(cid, 0, from, hash), vec![0, 1, 2, 3])
            .await
            .unwrap()
            .unwrap()
    }

    async fn wait_for_accept(transport: &RecordingTransport) -> ConsensusMessage {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(accept) = transport.sent(MessageKind::Accept).pop() {
                    return accept;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("ACCEPT was never sent")
    }

    #[tokio::test]
    async fn test_replica_runs_through_all_phases() {
        let mut h = harness(1, accept_all());
        let propose = ConsensusMessage::propose(1, 0, 0, b"value".to_vec());
        let hash = propose.value_hash;

        h.acceptor.deliver(propose);
        assert_eq!(h.acceptor.phase(1), Some(Phase::WriteSent));
        let writes = h.transport.sent(MessageKind::Write);
        assert_eq!(writes, vec![ConsensusMessage::write(1, 0, 1, hash)]);

        h.acceptor.deliver(ConsensusMessage::write(1, 0, 0, hash));
        assert_eq!(h.acceptor.phase(1), Some(Phase::WriteSent));
        h.acceptor.deliver(ConsensusMessage::write(1, 0, 2, hash));
        assert_eq!(h.acceptor.phase(1), Some(Phase::AcceptSent));

        let accept = wait_for_accept(&h.transport).await;
        assert_eq!(accept.value_hash, hash);
        assert_eq!(accept.sender, 1);

        h.acceptor.deliver(signed_accept(0, 1, hash).await);
        assert!(h.decisions.try_recv().is_err());
        h.acceptor.deliver(signed_accept(2, 1, hash).await);

        let decision = h.decisions.recv().await.unwrap();
        assert_eq!(decision.value, b"value".to_vec());
        assert_eq!(h.acceptor.phase(1), Some(Phase::Decided));
        assert_eq!(h.acceptor.decision(1), Some(decision));

        // Late votes for a decided instance change nothing.
        h.acceptor.deliver(signed_accept(3, 1, hash).await);
        assert!(h.decisions.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_votes_are_not_double_counted() {
        let h = harness(1, accept_all());
        let propose = ConsensusMessage::propose(1, 0, 0, b"value".to_vec());
        let hash = propose.value_hash;
        h.acceptor.deliver(propose);

        for _ in 0..3 {
            h.acceptor.deliver(ConsensusMessage::write(1, 0, 2, hash));
        }
        assert_eq!(h.acceptor.phase(1), Some(Phase::WriteSent));
    }

    #[tokio::test]
    async fn test_accept_without_valid_proof_is_discarded() {
        let mut h = harness(1, accept_all());
        let propose = ConsensusMessage::propose(1, 0, 0, b"value".to_vec());
        let hash = propose.value_hash;
        h.acceptor.deliver(propose);
        for sender in [0, 2] {
            h.acceptor.deliver(ConsensusMessage::write(1, 0, sender, hash));
        }

        h.acceptor.deliver(ConsensusMessage::accept(1, 0, 0, hash));
        let mut forged = signed_accept(3, 1, hash).await;
        forged.sender = 2;
        h.acceptor.deliver(forged);
        assert!(h.decisions.try_recv().is_err());
        assert_eq!(h.acceptor.phase(1), Some(Phase::AcceptSent));
    }

    #[tokio::test]
    async fn test_invalid_value_suspects_leader() {
        let h = harness(2, Arc::new(|value: &[u8]| !value.is_empty()));
        h.acceptor.deliver(ConsensusMessage::propose(1, 0, 0, Vec::new()));

        assert_eq!(h.leader.current_leader(), 1);
        assert_eq!(h.acceptor.phase(1), Some(Phase::Init));
        assert!(h.transport.sent(MessageKind::Write).is_empty());
    }

    #[tokio::test]
    async fn test_proposal_from_non_leader_is_buffered_and_replayed() {
        let h = harness(2, accept_all());
        h.acceptor.deliver(ConsensusMessage::propose(5, 0, 3, b"early".to_vec()));
        assert_eq!(h.acceptor.phase(5), Some(Phase::Init));
        assert!(h.transport.sent(MessageKind::Write).is_empty());

        h.leader.request_leader(3);
        h.acceptor.leader_installed(3);
        assert_eq!(h.acceptor.phase(5), Some(Phase::WriteSent));
        assert_eq!(h.transport.sent(MessageKind::Write).len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_proposal_is_ignored() {
        let h = harness(1, accept_all());
        h.acceptor.deliver(ConsensusMessage::propose(1, 0, 0, b"first".to_vec()));
        h.acceptor.deliver(ConsensusMessage::propose(1, 0, 0, b"second".to_vec()));

        let writes = h.transport.sent(MessageKind::Write);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].value_hash, value_digest(b"first"));
    }

    #[tokio::test]
    async fn test_speculation_on_wrong_value_is_regenerated() {
        let h = harness(1, accept_all());
        // A Byzantine WRITE for another value arrives before the PROPOSE.
        h.acceptor.deliver(ConsensusMessage::write(1, 0, 3, value_digest(b"forged")));

        let propose = ConsensusMessage::propose(1, 0, 0, b"value".to_vec());
        let hash = propose.value_hash;
        h.acceptor.deliver(propose);
        h.acceptor.deliver(ConsensusMessage::write(1, 0, 0, hash));
        h.acceptor.deliver(ConsensusMessage::write(1, 0, 2, hash));

        let accept = wait_for_accept(&h.transport).await;
        assert_eq!(accept.value_hash, hash);
        assert_eq!(h.transport.sent(MessageKind::Accept).len(), 1);
    }

    #[tokio::test]
    async fn test_state_is_bounded_ahead_of_decisions() {
        let h = harness(2, accept_all());
        // Replica 3 is not leader and floods far-future instances.
        for cid in 1..=2000u64 {
            let propose = ConsensusMessage::propose(cid, 0, 3, vec![cid as u8]);
            h.acceptor.deliver(ConsensusMessage::write(cid, 0, 3, propose.value_hash));
            h.acceptor.deliver(propose);
        }

        assert_eq!(lock(&h.acceptor.instances).len(), 50);
        assert_eq!(h.acceptor.phase(51), None);
        let buffered = lock(&h.acceptor.buffered);
        assert_eq!(buffered.len(), 1);
        assert_eq!(buffered.get(&3).map(|proposal| proposal.cid), Some(50));
    }

    #[tokio::test]
    async fn test_non_leader_probes_propose_latency() {
        let Harness { acceptor, transport, .. } = harness(1, accept_all());
        let monitor = Arc::new(Monitor::new(1, 4, 100, true).with_probe_overhead(4.0));
        let acceptor = acceptor.with_monitor(Arc::clone(&monitor));

        let propose = ConsensusMessage::propose(1, 0, 0, b"value".to_vec());
        let hash = propose.value_hash;
        acceptor.deliver(propose);
        let probes = transport.sent(MessageKind::DummyPropose);
        assert_eq!(probes, vec![ConsensusMessage::dummy_propose(1, 1, b"value".to_vec())]);

        // Probes from others are answered, not counted as votes.
        acceptor.deliver(ConsensusMessage::dummy_propose(1, 3, b"value".to_vec()));
        assert_eq!(
            transport.sent(MessageKind::ProposeResponse),
            vec![ConsensusMessage::propose_response(1, 1, hash)]
        );
        assert_eq!(acceptor.phase(1), Some(Phase::WriteSent));

        acceptor.deliver(ConsensusMessage::propose_response(1, 2, hash));
        let propose_row = monitor.measurements().propose;
        assert_eq!(propose_row[1], 0);
        assert_ne!(propose_row[2], MISSING);
        assert_eq!(propose_row[3], MISSING);
    }

    #[tokio::test]
    async fn test_non_leader_does_not_propose() {
        let h = harness(2, accept_all());
        h.acceptor.propose(1, b"value".to_vec());
        assert!(h.transport.sent(MessageKind::Propose).is_empty());
        assert_eq!(h.acceptor.phase(1), None);
    }
}
