use std::{cmp::Ordering, collections::BTreeSet, fmt};

use thiserror::Error;

/*
    Replicas are split into two classes: R_max carries the larger vote
    weight V_max, R_min carries V_min = 1. With delta spare replicas beyond
    the minimum, V_max = 1 + delta / f, and a quorum needs 2 f V_max + 1 of
    weight (f V_max + 1 when only crashes are tolerated). Any two quorums
    still intersect in a correct replica, but the fast replicas in R_max can
    form one with fewer members.
*/

pub type ReplicaId = usize;

/// Weight given to every replica in `R_min`.
pub const V_MIN: f64 = 1.0;

/// Fault model the deployment tolerates.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultMode {
    Byzantine,
    Crash,
}

impl FaultMode {
    pub fn from_bft(bft: bool) -> Self {
        if bft {
            FaultMode::Byzantine
        } else {
            FaultMode::Crash
        }
    }

    pub fn is_bft(&self) -> bool {
        *self == FaultMode::Byzantine
    }

    /// Number of replicas in `R_max`.
    pub fn u(&self, f: usize) -> usize {
        match self {
            FaultMode::Byzantine => 2 * f,
            FaultMode::Crash => f,
        }
    }

    /// Smallest system that tolerates `f` faults with `delta` spares.
    pub fn min_replicas(&self, f: usize, delta: usize) -> usize {
        match self {
            FaultMode::Byzantine => 3 * f + 1 + delta,
            FaultMode::Crash => 2 * f + 1 + delta,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Weights {
    pub v_min: f64,
    pub v_max: f64,
    pub quorum: f64,
}

impl Weights {
    pub fn new(mode: FaultMode, f: usize, delta: usize) -> Self {
        let v_max = V_MIN + delta as f64 / f as f64;
        let quorum = match mode {
            FaultMode::Byzantine => 2.0 * f as f64 * v_max + 1.0,
            FaultMode::Crash => f as f64 * v_max + 1.0,
        };
        Weights {
            v_min: V_MIN,
            v_max,
            quorum,
        }
    }

    pub fn weight_of(&self, config: &WeightConfiguration, replica: ReplicaId) -> f64 {
        if config.is_max(replica) {
            self.v_max
        } else {
            self.v_min
        }
    }
}

/// A tally reaches quorum once it exceeds the threshold by more than
/// `epsilon`, a small negative tolerance for floating-point rounding.
pub fn quorum_reached(weight: f64, quorum: f64, epsilon: f64) -> bool {
    weight - quorum > epsilon
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WeightError {
    #[error("R_max must hold {expected} replicas, got {actual}")]
    WrongRmaxSize { expected: usize, actual: usize },

    #[error("replica {0} is not part of the replica set")]
    UnknownReplica(ReplicaId),

    #[error("replica {0} is listed more than once")]
    Duplicate(ReplicaId),
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct WeightConfiguration {
    r_max: BTreeSet<ReplicaId>,
    r_min: BTreeSet<ReplicaId>,
}

impl WeightConfiguration {
    /// Builds a configuration where `r_max` get V_max and every other member
    /// of `replicas` gets V_min.
    pub fn new(
        u: usize,
        r_max: impl IntoIterator<Item = ReplicaId>,
        replicas: &[ReplicaId],
    ) -> Result<Self, WeightError> {
        let all: BTreeSet<ReplicaId> = replicas.iter().copied().collect();
        if all.len() != replicas.len() {
            let mut seen = BTreeSet::new();
            for id in replicas {
                if !seen.insert(*id) {
                    return Err(WeightError::Duplicate(*id));
                }
            }
        }

        let mut max = BTreeSet::new();
        for id in r_max {
            if !all.contains(&id) {
                return Err(WeightError::UnknownReplica(id));
            }
            if !max.insert(id) {
                return Err(WeightError::Duplicate(id));
            }
        }
        if max.len() != u {
            return Err(WeightError::WrongRmaxSize {
                expected: u,
                actual: max.len(),
            });
        }

        let min = all.difference(&max).copied().collect();
        Ok(WeightConfiguration {
            r_max: max,
            r_min: min,
        })
    }

    /// The first `u` replicas of the permutation go to `R_max`.
    pub fn from_permutation(u: usize, replicas: &[ReplicaId]) -> Self {
        let u = u.min(replicas.len());
        WeightConfiguration {
            r_max: replicas[..u].iter().copied().collect(),
            r_min: replicas[u..].iter().copied().collect(),
        }
    }

    /// Every way of choosing `u` replicas for `R_max`, in lexicographic order.
    pub fn all(u: usize, replicas: &[ReplicaId]) -> Vec<WeightConfiguration> {
        let n = replicas.len();
        if u > n {
            return Vec::new();
        }

        let mut configs = Vec::new();
        let mut indices: Vec<usize> = (0..u).collect();
        loop {
            let r_max: BTreeSet<ReplicaId> = indices.iter().map(|&i| replicas[i]).collect();
            let r_min = replicas
                .iter()
                .copied()
                .filter(|id| !r_max.contains(id))
                .collect();
            configs.push(WeightConfiguration { r_max, r_min });

            // Advance to the next combination.
            let mut i = u;
            loop {
                if i == 0 {
                    return configs;
                }
                i -= 1;
                if indices[i] != i + n - u {
                    break;
                }
            }
            indices[i] += 1;
            for j in i + 1..u {
                indices[j] = indices[j - 1] + 1;
            }
        }
    }

    pub fn r_max(&self) -> &BTreeSet<ReplicaId> {
        &self.r_max
    }

    pub fn r_min(&self) -> &BTreeSet<ReplicaId> {
        &self.r_min
    }

    pub fn is_max(&self, replica: ReplicaId) -> bool {
        self.r_max.contains(&replica)
    }

    pub fn u(&self) -> usize {
        self.r_max.len()
    }

    pub fn len(&self) -> usize {
        self.r_max.len() + self.r_min.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All replicas in ascending id order.
    pub fn replicas(&self) -> Vec<ReplicaId> {
        self.r_max.union(&self.r_min).copied().collect()
    }

    /// Moves `max` into `R_min` and `min` into `R_max`. Returns false and
    /// leaves the configuration untouched if either replica is in the wrong
    /// class.
    pub fn swap(&mut self, max: ReplicaId, min: ReplicaId) -> bool {
        if !self.r_max.contains(&max) || !self.r_min.contains(&min) {
            return false;
        }
        self.r_max.remove(&max);
        self.r_min.remove(&min);
        self.r_max.insert(min);
        self.r_min.insert(max);
        true
    }
}

impl fmt::Display for WeightConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R_max={:?}, R_min={:?}", self.r_max, self.r_min)
    }
}

/// A weight configuration paired with a leader, scored by the simulator.
#[derive(Clone, Debug)]
pub struct CandidateConfiguration {
    pub weights: WeightConfiguration,
    pub leader: ReplicaId,
    pub predicted_latency: i64,
}

impl CandidateConfiguration {
    pub fn new(weights: WeightConfiguration, leader: ReplicaId, predicted_latency: i64) -> Self {
        CandidateConfiguration {
            weights,
            leader,
            predicted_latency,
        }
    }
}

impl PartialEq for CandidateConfiguration {
    fn eq(&self, other: &Self) -> bool {
        self.leader == other.leader && self.weights == other.weights
    }
}

impl Eq for CandidateConfiguration {}

impl PartialOrd for CandidateConfiguration {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Ordered by latency only; equality additionally needs the same partition and
// leader, so ties of distinct candidates compare Equal without being ==.
impl Ord for CandidateConfiguration {
    fn cmp(&self, other: &Self) -> Ordering {
        self.predicted_latency.cmp(&other.predicted_latency)
    }
}

impl fmt::Display for CandidateConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} with leader {} and latency of {}",
            self.weights, self.leader, self.predicted_latency
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn replicas(n: usize) -> Vec<ReplicaId> {
        (0..n).collect()
    }

    #[test]
    fn test_weights_bft() {
        let weights = Weights::new(FaultMode::Byzantine, 1, 1);
        assert_eq!(weights.v_max, 2.0);
        assert_eq!(weights.quorum, 5.0);
    }

    #[test]
    fn test_weights_cft() {
        let weights = Weights::new(FaultMode::Crash, 2, 1);
        assert_eq!(weights.v_max, 1.5);
        assert_eq!(weights.quorum, 4.0);
    }

    #[test]
    fn test_quorum_boundary_around_epsilon() {
        let epsilon = -1e-10;
        let quorum = 5.0;
        assert!(quorum_reached(quorum + epsilon / 2.0, quorum, epsilon));
        assert!(!quorum_reached(quorum + 2.0 * epsilon, quorum, epsilon));
        assert!(quorum_reached(quorum, quorum, epsilon));
    }

    #[test]
    fn test_new_rejects_bad_partitions() {
        let set = replicas(5);
        assert_eq!(
            WeightConfiguration::new(2, [0], &set),
            Err(WeightError::WrongRmaxSize { expected: 2, actual: 1 })
        );
        assert_eq!(
            WeightConfiguration::new(2, [0, 9], &set),
            Err(WeightError::UnknownReplica(9))
        );
        assert_eq!(
            WeightConfiguration::new(2, [1, 1], &set),
            Err(WeightError::Duplicate(1))
        );
    }

    #[test]
    fn test_all_counts_combinations() {
        assert_eq!(WeightConfiguration::all(2, &replicas(5)).len(), 10);
        assert_eq!(WeightConfiguration::all(4, &replicas(7)).len(), 35);
        assert_eq!(WeightConfiguration::all(0, &replicas(3)).len(), 1);
        assert!(WeightConfiguration::all(4, &replicas(3)).is_empty());

        let first = &WeightConfiguration::all(2, &replicas(5))[0];
        assert_eq!(first, &WeightConfiguration::from_permutation(2, &replicas(5)));
    }

    #[test]
    fn test_swap() {
        let mut config = WeightConfiguration::from_permutation(2, &replicas(5));
        assert!(config.swap(0, 4));
        assert!(config.is_max(4));
        assert!(!config.is_max(0));
        assert!(!config.swap(0, 1));
        assert_eq!(config.u(), 2);
    }

    #[test]
    fn test_candidate_equality_ignores_latency() {
        let weights = WeightConfiguration::from_permutation(2, &replicas(5));
        let a = CandidateConfiguration::new(weights.clone(), 0, 10);
        let b = CandidateConfiguration::new(weights.clone(), 0, 20);
        let c = CandidateConfiguration::new(weights, 1, 5);
        assert_eq!(a, b);
        assert!(a < b);
        assert!(c < a);
    }

    proptest! {
        #[test]
        fn prop_generated_configurations_partition_the_replica_set(
            n in 1usize..9,
            u_seed in 0usize..9,
        ) {
            let u = u_seed % (n + 1);
            let set = replicas(n);
            let all = WeightConfiguration::all(u, &set);
            prop_assert!(!all.is_empty());
            for config in all {
                prop_assert_eq!(config.r_max().len(), u);
                prop_assert!(config.r_max().is_disjoint(config.r_min()));
                prop_assert_eq!(config.replicas(), set.clone());
            }
        }
    }
}
