use std::{sync::Arc, time::Duration};

use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, info};

use super::{Executor, OrderedBroadcast, Transport, ValueValidator};
use crate::{
    common::crypto::{Authenticator, Keypair, Pubkey},
    config::{Config, ConfigError},
    consensus::{Acceptor, AcceptorContext, ConsensusMessage, LeaderChange, Membership, ProofPool, StaticView, ViewSnapshot},
    weights::{
        ConfigurationOptimizer, Measurements, MeasurementError, Monitor, ReconfigurationController, ReplicaId,
        WeightConfiguration,
    },
};

/// What a node needs from the outside world.
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub ordered: Arc<dyn OrderedBroadcast>,
    pub validator: Arc<dyn ValueValidator>,
    pub executor: Arc<dyn Executor>,
    pub leader_change: Arc<dyn LeaderChange>,
}

/// Everything one replica runs, built once per process and shared by handle.
pub struct Node {
    pub id: ReplicaId,
    pub authenticator: Arc<Authenticator>,
    pub view: Arc<StaticView>,
    pub monitor: Arc<Monitor>,
    pub controller: Option<Arc<ReconfigurationController>>,
    pub acceptor: Arc<Acceptor>,
    leader_change: Arc<dyn LeaderChange>,
    ordered: Arc<dyn OrderedBroadcast>,
    sync_schedule: Option<(Duration, Duration)>,
}

impl Node {
    pub fn new(
        config: &Config,
        keypair: Keypair,
        members: Vec<Pubkey>,
        collaborators: Collaborators,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let replication = &config.replication;
        if members.len() != replication.n {
            return Err(ConfigError::Members {
                expected: replication.n,
                actual: members.len(),
            });
        }

        let id = replication.me;
        let mode = config.fault_mode();
        let replicas: Vec<ReplicaId> = (0..replication.n).collect();
        let view = Arc::new(StaticView::new(ViewSnapshot {
            id: 0,
            me: id,
            f: replication.f,
            delta: replication.delta,
            mode,
            weights: WeightConfiguration::from_permutation(mode.u(replication.f), &replicas),
            members,
        }));

        let authenticator = Arc::new(Authenticator::new(
            id,
            keypair,
            config.consensus.proof_scheme,
            config.consensus.mac_key_retries,
            config.mac_key_backoff(),
        ));
        let monitor = Arc::new(
            Monitor::new(
                id,
                replication.n,
                config.monitoring.window,
                config.monitoring.use_dummy_propose,
            )
            .with_probe_overhead(config.monitoring.probe_overhead),
        );

        let controller = config.optimizer.use_dynamic_weights.then(|| {
            let optimizer = ConfigurationOptimizer::new(config.simulator(), config.optimizer_settings());
            Arc::new(ReconfigurationController::new(
                config.controller_settings(),
                Arc::new(optimizer),
                Arc::clone(&monitor),
                view.clone(),
                Arc::clone(&collaborators.leader_change),
            ))
        });

        let mut acceptor = Acceptor::new(
            ProofPool::new(Arc::clone(&authenticator), config.proof_workers()),
            AcceptorContext {
                membership: view.clone(),
                leader_change: Arc::clone(&collaborators.leader_change),
                transport: collaborators.transport,
                validator: collaborators.validator,
                executor: collaborators.executor,
            },
            config.acceptor_settings(),
        )
        .with_monitor(Arc::clone(&monitor));
        if let Some(controller) = &controller {
            acceptor = acceptor.with_controller(Arc::clone(controller));
        }

        info!(
            id,
            n = replication.n,
            f = replication.f,
            delta = replication.delta,
            ?mode,
            dynamic_weights = controller.is_some(),
            "Node initialized"
        );
        Ok(Node {
            id,
            authenticator,
            view,
            monitor,
            controller,
            acceptor: Arc::new(acceptor),
            leader_change: collaborators.leader_change,
            ordered: collaborators.ordered,
            sync_schedule: config.sync_schedule(),
        })
    }

    pub fn snapshot(&self) -> Arc<ViewSnapshot> {
        self.view.snapshot()
    }

    pub fn leader(&self) -> ReplicaId {
        self.leader_change.current_leader()
    }

    /// Hands this replica's latest latency vectors to the ordered broadcast.
    pub fn publish_measurements(&self) {
        publish(&self.monitor, self.ordered.as_ref());
    }

    /// Applies a measurement payload in the order the broadcast delivered it.
    pub fn on_ordered(&self, payload: &[u8]) -> Result<(), MeasurementError> {
        let measurements = Measurements::from_bytes(payload)?;
        self.monitor.on_ordered_measurements(&measurements)
    }

    /// Runs the acceptor and, alongside it, the periodic publication of
    /// this replica's measurements.
    pub async fn run(&self, inbox: UnboundedReceiver<ConsensusMessage>) {
        let synchronizer = self.spawn_synchronizer();
        self.acceptor.run(inbox).await;
        if let Some(synchronizer) = synchronizer {
            synchronizer.abort();
        }
    }

    fn spawn_synchronizer(&self) -> Option<JoinHandle<()>> {
        let (delay, period) = self.sync_schedule?;
        let monitor = Arc::clone(&self.monitor);
        let ordered = Arc::clone(&self.ordered);
        info!(id = self.id, ?delay, ?period, "Disseminating latency measurements periodically");
        Some(tokio::spawn(async move {
            let mut ticks = time::interval_at(Instant::now() + delay, period);
            loop {
                ticks.tick().await;
                publish(&monitor, ordered.as_ref());
            }
        }))
    }
}

fn publish(monitor: &Monitor, ordered: &dyn OrderedBroadcast) {
    let measurements = monitor.measurements();
    debug!(id = measurements.sender, "Publishing latency measurements");
    ordered.order(measurements.to_bytes());
}
