use std::{
    cmp::Ordering,
    collections::VecDeque,
    time::{Duration, Instant},
};

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{
    configuration::{CandidateConfiguration, ReplicaId, WeightConfiguration},
    latency::{LatencyMatrix, MISSING},
    simulator::LatencySimulator,
};

/*
    The search space is every choice of u replicas for R_max times every
    leader in R_max, C(n, u) * u candidates. Small systems are searched
    exhaustively; larger ones use simulated annealing. Tabu search and random
    sampling score candidates the same way and are kept for calibrating the
    heuristics against the exhaustive optimum.
*/

#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Exhaustive up to the cutoff, annealing above it.
    Auto,
    Exhaustive,
    Annealing,
    Tabu,
    Sampling,
}

#[derive(Clone, Copy, PartialEq, Debug, Deserialize)]
#[serde(default)]
pub struct AnnealingParams {
    pub initial_temperature: f64,
    pub cooling_rate: f64,
    pub stopping_temperature: f64,
    /// Rounds simulated per step; lower than the final scoring for speed.
    pub rounds: usize,
}

impl Default for AnnealingParams {
    fn default() -> Self {
        AnnealingParams {
            initial_temperature: 120.0,
            cooling_rate: 0.0055,
            stopping_temperature: 0.2,
            rounds: 1,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize)]
#[serde(default)]
pub struct TabuParams {
    pub iterations: usize,
    /// Iterations a moved replica stays tabu.
    pub tenure: usize,
}

impl Default for TabuParams {
    fn default() -> Self {
        TabuParams {
            iterations: 50,
            tenure: 3,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub samples: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        SamplingParams { samples: 500 }
    }
}

#[derive(Clone, Debug)]
pub struct SearchResult {
    pub best: CandidateConfiguration,
    pub worst_latency: i64,
    pub evaluations: usize,
    pub elapsed: Duration,
}

/// Everything a strategy needs to score candidates.
#[derive(Clone, Debug)]
pub struct SearchSpace<'a> {
    pub simulator: LatencySimulator,
    pub replicas: Vec<ReplicaId>,
    pub u: usize,
    pub propose: &'a LatencyMatrix,
    pub write: &'a LatencyMatrix,
    pub rounds: usize,
    pub leader_selection: bool,
    pub current_leader: ReplicaId,
}

impl<'a> SearchSpace<'a> {
    fn score(&self, weights: &WeightConfiguration, leader: ReplicaId, rounds: usize) -> Option<i64> {
        match self
            .simulator
            .predict(leader, weights, self.propose, self.write, rounds)
        {
            Ok(latency) => Some(latency),
            Err(e) => {
                warn!(%weights, leader, error = %e, "Skipping candidate that cannot be scored");
                None
            }
        }
    }

    fn candidate(
        &self,
        weights: WeightConfiguration,
        leader: ReplicaId,
        rounds: usize,
    ) -> Option<CandidateConfiguration> {
        let latency = self.score(&weights, leader, rounds)?;
        Some(CandidateConfiguration::new(weights, leader, latency))
    }

    fn leaders(&self, weights: &WeightConfiguration) -> Vec<ReplicaId> {
        if self.leader_selection {
            weights.r_max().iter().copied().collect()
        } else {
            vec![self.current_leader]
        }
    }

    /// With leader selection the leader must come from R_max.
    fn normalize_leader(&self, weights: &WeightConfiguration, leader: ReplicaId) -> ReplicaId {
        if !self.leader_selection || weights.is_max(leader) {
            return leader;
        }
        weights.r_max().iter().next().copied().unwrap_or(leader)
    }

    fn leader_after_swap(&self, leader: ReplicaId, max: ReplicaId, min: ReplicaId) -> ReplicaId {
        if self.leader_selection && leader == max {
            min
        } else {
            leader
        }
    }

    /// Lower latency wins; on a tie keep the current leader, then the lowest
    /// leader id, then whichever was seen first.
    pub fn prefers(&self, candidate: &CandidateConfiguration, incumbent: &CandidateConfiguration) -> bool {
        match candidate.cmp(incumbent) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => {
                let current = self.current_leader;
                match (candidate.leader == current, incumbent.leader == current) {
                    (true, false) => true,
                    (false, true) => false,
                    _ => candidate.leader < incumbent.leader,
                }
            }
        }
    }

    fn fallback(&self) -> CandidateConfiguration {
        let weights = WeightConfiguration::from_permutation(self.u, &self.replicas);
        let leader = self.normalize_leader(&weights, self.current_leader);
        CandidateConfiguration::new(weights, leader, MISSING)
    }
}

struct Tracker<'s, 'a> {
    space: &'s SearchSpace<'a>,
    best: Option<CandidateConfiguration>,
    worst: i64,
    evaluations: usize,
    started: Instant,
}

impl<'s, 'a> Tracker<'s, 'a> {
    fn new(space: &'s SearchSpace<'a>) -> Self {
        Tracker {
            space,
            best: None,
            worst: i64::MIN,
            evaluations: 0,
            started: Instant::now(),
        }
    }

    fn observe(&mut self, candidate: &CandidateConfiguration) {
        self.evaluations += 1;
        self.worst = self.worst.max(candidate.predicted_latency);
        let better = match &self.best {
            Some(best) => self.space.prefers(candidate, best),
            None => true,
        };
        if better {
            self.best = Some(candidate.clone());
        }
    }

    fn finish(self) -> SearchResult {
        let best = self.best.unwrap_or_else(|| self.space.fallback());
        let worst_latency = if self.evaluations == 0 {
            best.predicted_latency
        } else {
            self.worst
        };
        SearchResult {
            best,
            worst_latency,
            evaluations: self.evaluations,
            elapsed: self.started.elapsed(),
        }
    }
}

/// Scores every partition and, with leader selection, every leader in R_max.
pub fn exhaustive(space: &SearchSpace) -> SearchResult {
    let mut tracker = Tracker::new(space);
    for weights in WeightConfiguration::all(space.u, &space.replicas) {
        for leader in space.leaders(&weights) {
            if let Some(candidate) = space.candidate(weights.clone(), leader, space.rounds) {
                tracker.observe(&candidate);
            }
        }
    }
    tracker.finish()
}

/// Geometric cooling: each step multiplies the temperature by
/// `1 - cooling_rate` and iteration stops once it falls below the threshold.
#[derive(Clone, Debug)]
pub struct CoolingSchedule {
    temperature: f64,
    cooling_rate: f64,
    stopping_temperature: f64,
}

impl CoolingSchedule {
    pub fn new(params: &AnnealingParams) -> Self {
        CoolingSchedule {
            temperature: params.initial_temperature,
            cooling_rate: params.cooling_rate.clamp(f64::EPSILON, 1.0 - f64::EPSILON),
            stopping_temperature: params.stopping_temperature.max(f64::MIN_POSITIVE),
        }
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }
}

impl Iterator for CoolingSchedule {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        if self.temperature < self.stopping_temperature {
            return None;
        }
        let current = self.temperature;
        self.temperature *= 1.0 - self.cooling_rate;
        Some(current)
    }
}

/// Simulated annealing over single swaps between R_max and R_min. Seeded so
/// that replicas running the same search reach the same result.
pub fn simulated_annealing(
    space: &SearchSpace,
    start: &CandidateConfiguration,
    params: &AnnealingParams,
    seed: u64,
) -> SearchResult {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tracker = Tracker::new(space);
    let fast = params.rounds.max(1);

    let leader = space.normalize_leader(&start.weights, start.leader);
    let mut current = match space.candidate(start.weights.clone(), leader, fast) {
        Some(candidate) => candidate,
        None => return tracker.finish(),
    };
    tracker.worst = current.predicted_latency;
    let mut best = current.clone();

    let mut schedule = CoolingSchedule::new(params);
    let mut accepted_worse = 0usize;
    for temperature in schedule.by_ref() {
        let r_max: Vec<ReplicaId> = current.weights.r_max().iter().copied().collect();
        let r_min: Vec<ReplicaId> = current.weights.r_min().iter().copied().collect();
        if r_max.is_empty() || r_min.is_empty() {
            break;
        }

        let max = r_max[rng.gen_range(0..r_max.len())];
        let min = r_min[rng.gen_range(0..r_min.len())];
        let mut weights = current.weights.clone();
        weights.swap(max, min);
        let leader = space.leader_after_swap(current.leader, max, min);

        let Some(next) = space.candidate(weights, leader, fast) else {
            continue;
        };
        tracker.evaluations += 1;
        tracker.worst = tracker.worst.max(next.predicted_latency);

        if space.prefers(&next, &best) {
            best = next.clone();
        }

        if next.predicted_latency < current.predicted_latency {
            current = next;
        } else {
            let delta = (next.predicted_latency - current.predicted_latency) as f64;
            if (-delta / temperature).exp() > rng.gen::<f64>() {
                accepted_worse += 1;
                current = next;
            }
        }
    }
    debug!(
        steps = tracker.evaluations,
        accepted_worse,
        final_temperature = schedule.temperature(),
        "Annealing finished"
    );

    if let Some(latency) = space.score(&best.weights, best.leader, space.rounds) {
        best.predicted_latency = latency;
    }
    tracker.best = Some(best);
    tracker.finish()
}

/// Steepest-descent over the swap neighbourhood, with recently moved
/// replicas tabu unless the move beats the best seen so far.
pub fn tabu_search(space: &SearchSpace, start: &CandidateConfiguration, params: &TabuParams) -> SearchResult {
    let mut tracker = Tracker::new(space);
    let leader = space.normalize_leader(&start.weights, start.leader);
    let mut current = match space.candidate(start.weights.clone(), leader, space.rounds) {
        Some(candidate) => candidate,
        None => return tracker.finish(),
    };
    tracker.observe(&current);

    let mut tabu: VecDeque<ReplicaId> = VecDeque::new();
    for _ in 0..params.iterations {
        let mut chosen: Option<(CandidateConfiguration, Option<(ReplicaId, ReplicaId)>)> = None;
        let best_latency = tracker
            .best
            .as_ref()
            .map_or(i64::MAX, |b| b.predicted_latency);

        let mut consider = |candidate: CandidateConfiguration, moved: Option<(ReplicaId, ReplicaId)>| {
            let is_tabu = moved.is_some_and(|(a, b)| tabu.contains(&a) || tabu.contains(&b));
            if is_tabu && candidate.predicted_latency >= best_latency {
                return;
            }
            let better = match &chosen {
                Some((incumbent, _)) => space.prefers(&candidate, incumbent),
                None => true,
            };
            if better {
                chosen = Some((candidate, moved));
            }
        };

        for &max in current.weights.r_max() {
            for &min in current.weights.r_min() {
                let mut weights = current.weights.clone();
                weights.swap(max, min);
                let leader = space.leader_after_swap(current.leader, max, min);
                if let Some(candidate) = space.candidate(weights, leader, space.rounds) {
                    tracker.observe(&candidate);
                    consider(candidate, Some((max, min)));
                }
            }
        }
        if space.leader_selection {
            for &leader in current.weights.r_max() {
                if leader == current.leader {
                    continue;
                }
                if let Some(candidate) = space.candidate(current.weights.clone(), leader, space.rounds) {
                    tracker.observe(&candidate);
                    consider(candidate, None);
                }
            }
        }

        let Some((next, moved)) = chosen else {
            break;
        };
        if let Some((max, min)) = moved {
            tabu.push_back(max);
            tabu.push_back(min);
            while tabu.len() > 2 * params.tenure {
                tabu.pop_front();
            }
        }
        current = next;
    }
    tracker.finish()
}

/// Scores uniformly random partitions (and leaders).
pub fn random_sampling(space: &SearchSpace, params: &SamplingParams, seed: u64) -> SearchResult {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tracker = Tracker::new(space);
    let mut permutation = space.replicas.clone();
    for _ in 0..params.samples {
        permutation.shuffle(&mut rng);
        let weights = WeightConfiguration::from_permutation(space.u, &permutation);
        let leader = if space.leader_selection && space.u > 0 {
            permutation[rng.gen_range(0..space.u)]
        } else {
            space.current_leader
        };
        if let Some(candidate) = space.candidate(weights, leader, space.rounds) {
            tracker.observe(&candidate);
        }
    }
    tracker.finish()
}

#[derive(Clone, Debug)]
pub struct OptimizerSettings {
    pub strategy: Strategy,
    pub exhaustive_cutoff: usize,
    pub rounds: usize,
    pub leader_selection: bool,
    pub annealing: AnnealingParams,
    pub tabu: TabuParams,
    pub sampling: SamplingParams,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        OptimizerSettings {
            strategy: Strategy::Auto,
            exhaustive_cutoff: 10,
            rounds: 10,
            leader_selection: true,
            annealing: AnnealingParams::default(),
            tabu: TabuParams::default(),
            sampling: SamplingParams::default(),
        }
    }
}

/// The active configuration scored on the same matrices, next to the best
/// one the search found.
#[derive(Clone, Debug)]
pub struct SearchOutcome {
    pub current: CandidateConfiguration,
    pub search: SearchResult,
}

#[derive(Clone, Debug)]
pub struct ConfigurationOptimizer {
    simulator: LatencySimulator,
    settings: OptimizerSettings,
}

impl ConfigurationOptimizer {
    pub fn new(simulator: LatencySimulator, settings: OptimizerSettings) -> Self {
        ConfigurationOptimizer { simulator, settings }
    }

    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    pub fn simulator(&self) -> &LatencySimulator {
        &self.simulator
    }

    /// Finds a low-latency configuration for the given sanitized matrices.
    /// `seed` must be identical on every replica (the triggering cid).
    pub fn compute_best(
        &self,
        propose: &LatencyMatrix,
        write: &LatencyMatrix,
        current: &WeightConfiguration,
        current_leader: ReplicaId,
        seed: u64,
    ) -> SearchOutcome {
        let replicas = current.replicas();
        let space = SearchSpace {
            simulator: self.simulator,
            replicas: replicas.clone(),
            u: self.simulator.mode.u(self.simulator.f),
            propose,
            write,
            rounds: self.settings.rounds,
            leader_selection: self.settings.leader_selection,
            current_leader,
        };

        let current_latency = space
            .score(current, current_leader, self.settings.rounds)
            .unwrap_or(MISSING);
        let current = CandidateConfiguration::new(current.clone(), current_leader, current_latency);

        let strategy = match self.settings.strategy {
            Strategy::Auto if replicas.len() <= self.settings.exhaustive_cutoff => Strategy::Exhaustive,
            Strategy::Auto => Strategy::Annealing,
            other => other,
        };
        let search = match strategy {
            Strategy::Exhaustive | Strategy::Auto => exhaustive(&space),
            Strategy::Annealing => simulated_annealing(&space, &current, &self.settings.annealing, seed),
            Strategy::Tabu => tabu_search(&space, &current, &self.settings.tabu),
            Strategy::Sampling => random_sampling(&space, &self.settings.sampling, seed),
        };

        info!(
            ?strategy,
            best = %search.best,
            worst = search.worst_latency,
            current = current.predicted_latency,
            evaluations = search.evaluations,
            elapsed_ms = search.elapsed.as_secs_f64() * 1000.0,
            "Computed best configuration"
        );
        SearchOutcome { current, search }
    }
}
