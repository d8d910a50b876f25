use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    common::crypto::ProofScheme,
    consensus::AcceptorSettings,
    weights::{
        AnnealingParams, ControllerSettings, FaultMode, LatencySimulator, OptimizerSettings, SamplingParams,
        Strategy, TabuParams,
    },
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{n} replicas cannot tolerate f = {f} with delta = {delta}, need at least {required}")]
    TooFewReplicas {
        n: usize,
        f: usize,
        delta: usize,
        required: usize,
    },

    #[error("f must be at least 1")]
    NoFaults,

    #[error("replica id {me} is outside [0, {n})")]
    UnknownReplica { me: usize, n: usize },

    #[error("quorum epsilon must be negative, got {0}")]
    Epsilon(f64),

    #[error("optimization goal must be at least 1.0, got {0}")]
    Goal(f64),

    #[error("calculation delay {delay} must be below the calculation interval {interval}")]
    Delay { delay: u64, interval: u64 },

    #[error("cooling rate must be in (0, 1), got {0}")]
    CoolingRate(f64),

    #[error("max_in_flight must be at least 1")]
    InFlight,

    #[error("probe overhead must be positive, got {0}")]
    ProbeOverhead(f64),

    #[error("expected {expected} public keys, got {actual}")]
    Members { expected: usize, actual: usize },
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub replication: ReplicationConfig,
    pub consensus: ConsensusConfig,
    pub optimizer: OptimizerConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicationConfig {
    pub me: usize,
    pub n: usize,
    pub f: usize,
    /// Spare replicas beyond the minimum.
    pub delta: usize,
    pub bft: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            me: 0,
            n: 4,
            f: 1,
            delta: 0,
            bft: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsensusConfig {
    pub quorum_epsilon: f64,
    pub proof_scheme: ProofScheme,
    /// Zero sizes the pool to the available cores.
    pub proof_workers: usize,
    pub mac_key_retries: u32,
    pub mac_key_backoff_ms: u64,
    pub gc_delay: u64,
    /// Instances past the last decision that messages may refer to.
    pub max_in_flight: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            quorum_epsilon: -1e-10,
            proof_scheme: ProofScheme::Signature,
            proof_workers: 0,
            mac_key_retries: 5,
            mac_key_backoff_ms: 10,
            gc_delay: 100,
            max_in_flight: 1000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerConfig {
    pub use_dynamic_weights: bool,
    pub leader_selection: bool,
    pub calculation_interval: u64,
    pub calculation_delay: u64,
    pub optimization_goal: f64,
    pub apply_timeout_ms: u64,
    pub exhaustive_cutoff: usize,
    pub rounds: usize,
    pub strategy: Strategy,
    pub annealing: AnnealingParams,
    pub tabu: TabuParams,
    pub sampling: SamplingParams,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            use_dynamic_weights: true,
            leader_selection: true,
            calculation_interval: 100,
            calculation_delay: 50,
            optimization_goal: 1.1,
            apply_timeout_ms: 2000,
            exhaustive_cutoff: 10,
            rounds: 10,
            strategy: Strategy::Auto,
            annealing: AnnealingParams::default(),
            tabu: TabuParams::default(),
            sampling: SamplingParams::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitoringConfig {
    /// Consensus instances per measurement window.
    pub window: u64,
    /// Measure PROPOSE latencies separately instead of reusing WRITE ones.
    pub use_dummy_propose: bool,
    /// Dummy PROPOSE probes per `n` instances.
    pub probe_overhead: f64,
    pub sync_delay_ms: u64,
    /// Zero disables the periodic dissemination of measurements.
    pub sync_period_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            window: 1000,
            use_dummy_propose: false,
            probe_overhead: 1.0,
            sync_delay_ms: 30_000,
            sync_period_ms: 20_000,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ReplicationConfig { me, n, f, delta, .. } = self.replication;
        if f == 0 {
            return Err(ConfigError::NoFaults);
        }
        let required = self.fault_mode().min_replicas(f, delta);
        if n < required {
            return Err(ConfigError::TooFewReplicas { n, f, delta, required });
        }
        if me >= n {
            return Err(ConfigError::UnknownReplica { me, n });
        }
        // NaN fails every comparison, so test for the valid range.
        if !(self.consensus.quorum_epsilon < 0.0) {
            return Err(ConfigError::Epsilon(self.consensus.quorum_epsilon));
        }

        let optimizer = &self.optimizer;
        if !(optimizer.optimization_goal >= 1.0) {
            return Err(ConfigError::Goal(optimizer.optimization_goal));
        }
        if optimizer.calculation_delay >= optimizer.calculation_interval {
            return Err(ConfigError::Delay {
                delay: optimizer.calculation_delay,
                interval: optimizer.calculation_interval,
            });
        }
        let cooling = optimizer.annealing.cooling_rate;
        if !(cooling > 0.0 && cooling < 1.0) {
            return Err(ConfigError::CoolingRate(cooling));
        }
        if self.consensus.max_in_flight == 0 {
            return Err(ConfigError::InFlight);
        }
        let overhead = self.monitoring.probe_overhead;
        if !(overhead > 0.0 && overhead.is_finite()) {
            return Err(ConfigError::ProbeOverhead(overhead));
        }
        Ok(())
    }

    pub fn fault_mode(&self) -> FaultMode {
        FaultMode::from_bft(self.replication.bft)
    }

    pub fn simulator(&self) -> LatencySimulator {
        LatencySimulator::new(
            self.fault_mode(),
            self.replication.f,
            self.replication.delta,
            self.consensus.quorum_epsilon,
        )
    }

    pub fn optimizer_settings(&self) -> OptimizerSettings {
        let optimizer = &self.optimizer;
        OptimizerSettings {
            strategy: optimizer.strategy,
            exhaustive_cutoff: optimizer.exhaustive_cutoff,
            rounds: optimizer.rounds,
            leader_selection: optimizer.leader_selection,
            annealing: optimizer.annealing,
            tabu: optimizer.tabu,
            sampling: optimizer.sampling,
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        let optimizer = &self.optimizer;
        ControllerSettings {
            enabled: optimizer.use_dynamic_weights,
            interval: optimizer.calculation_interval,
            delay: optimizer.calculation_delay,
            optimization_goal: optimizer.optimization_goal,
            leader_selection: optimizer.leader_selection,
            apply_timeout: Duration::from_millis(optimizer.apply_timeout_ms),
        }
    }

    pub fn acceptor_settings(&self) -> AcceptorSettings {
        AcceptorSettings {
            quorum_epsilon: self.consensus.quorum_epsilon,
            gc_delay: self.consensus.gc_delay,
            max_in_flight: self.consensus.max_in_flight,
        }
    }

    /// Initial delay and period of the measurement dissemination, if enabled.
    pub fn sync_schedule(&self) -> Option<(Duration, Duration)> {
        let monitoring = &self.monitoring;
        (monitoring.sync_period_ms > 0).then(|| {
            (
                Duration::from_millis(monitoring.sync_delay_ms),
                Duration::from_millis(monitoring.sync_period_ms),
            )
        })
    }

    pub fn mac_key_backoff(&self) -> Duration {
        Duration::from_millis(self.consensus.mac_key_backoff_ms)
    }

    pub fn proof_workers(&self) -> usize {
        match self.consensus.proof_workers {
            0 => std::thread::available_parallelism().map_or(1, |cores| cores.get()),
            workers => workers,
        }
    }
}
