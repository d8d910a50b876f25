use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
};

use thiserror::Error;

use super::{
    configuration::{quorum_reached, FaultMode, ReplicaId, WeightConfiguration, Weights},
    latency::LatencyMatrix,
};

/*
    Predicts how long a consensus instance takes under a given weight
    configuration and leader by replaying one protocol run over fixed
    point-to-point delays:

      t_proposed[i]       = max(offset[i], propose[leader][i])
      t_write_finished[i] = time the WRITEs arriving at i reach quorum weight
      t_decided[i]        = time the ACCEPTs arriving at i reach quorum weight

    Under crash faults the WRITE phase is skipped and ACCEPTs leave at
    t_proposed. With several rounds, replicas that decided after the leader
    start the next round late by the difference (pipelining), and the result
    is the mean over all rounds.
*/

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimulationError {
    #[error("latency matrix has {actual} rows but the configuration spans replica {max_id}")]
    Dimension { actual: usize, max_id: ReplicaId },

    #[error("leader {0} is not in the replica set")]
    UnknownLeader(ReplicaId),

    #[error("replica {0} cannot collect a quorum of votes")]
    QuorumUnreachable(ReplicaId),

    #[error("at least one round must be simulated")]
    NoRounds,
}

/// A simulated vote in flight.
#[derive(Clone, Copy, Debug)]
pub struct Vote {
    pub cast_by: ReplicaId,
    pub weight: f64,
    pub arrival_time: i64,
}

impl PartialEq for Vote {
    fn eq(&self, other: &Self) -> bool {
        self.arrival_time == other.arrival_time
    }
}

impl Eq for Vote {}

impl PartialOrd for Vote {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Vote {
    fn cmp(&self, other: &Self) -> Ordering {
        self.arrival_time.cmp(&other.arrival_time)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LatencySimulator {
    pub mode: FaultMode,
    pub f: usize,
    pub delta: usize,
    pub epsilon: f64,
}

impl LatencySimulator {
    pub fn new(mode: FaultMode, f: usize, delta: usize, epsilon: f64) -> Self {
        LatencySimulator {
            mode,
            f,
            delta,
            epsilon,
        }
    }

    /// Amortized decision latency at `leader` over `rounds` pipelined
    /// consensus instances.
    pub fn predict(
        &self,
        leader: ReplicaId,
        config: &WeightConfiguration,
        propose: &LatencyMatrix,
        write: &LatencyMatrix,
        rounds: usize,
    ) -> Result<i64, SimulationError> {
        if rounds == 0 {
            return Err(SimulationError::NoRounds);
        }

        let replicas = config.replicas();
        let n = propose.len().min(write.len());
        if let Some(&max_id) = replicas.last() {
            if max_id >= n {
                return Err(SimulationError::Dimension { actual: n, max_id });
            }
        }
        if !replicas.contains(&leader) {
            return Err(SimulationError::UnknownLeader(leader));
        }

        let weights = Weights::new(self.mode, self.f, self.delta);
        let mut v = vec![0.0; n];
        for &i in &replicas {
            v[i] = weights.weight_of(config, i);
        }

        let mut offsets = vec![0i64; n];
        let mut t_proposed = vec![0i64; n];
        let mut t_write_finished = vec![0i64; n];
        let mut t_decided = vec![0i64; n];
        let mut total: i64 = 0;

        for _ in 0..rounds {
            for &i in &replicas {
                t_proposed[i] = offsets[i].max(propose.get(leader, i));
            }

            if self.mode.is_bft() {
                for &i in &replicas {
                    let arrivals = replicas.iter().map(|&j| Vote {
                        cast_by: j,
                        weight: v[j],
                        arrival_time: t_proposed[j].saturating_add(write.get(j, i)),
                    });
                    t_write_finished[i] = self.drain(i, arrivals, weights.quorum)?;
                }
            }

            for &i in &replicas {
                let arrivals = replicas.iter().map(|&j| {
                    let sent = if self.mode.is_bft() {
                        t_write_finished[j]
                    } else {
                        t_proposed[i]
                    };
                    Vote {
                        cast_by: j,
                        weight: v[j],
                        arrival_time: sent.saturating_add(write.get(j, i)),
                    }
                });
                t_decided[i] = self.drain(i, arrivals, weights.quorum)?;
            }

            let latency = t_decided[leader];
            total = total.saturating_add(latency);

            for &i in &replicas {
                offsets[i] = (t_decided[i] - latency).max(0);
            }
        }

        Ok(total / rounds as i64)
    }

    // Pops votes in arrival order until their weight forms a quorum and
    // returns the arrival time of the vote that completed it.
    fn drain(
        &self,
        receiver: ReplicaId,
        arrivals: impl Iterator<Item = Vote>,
        quorum: f64,
    ) -> Result<i64, SimulationError> {
        let mut heap: BinaryHeap<Reverse<Vote>> = arrivals.map(Reverse).collect();
        let mut votes = 0.0;
        while let Some(Reverse(vote)) = heap.pop() {
            votes += vote.weight;
            if quorum_reached(votes, quorum, self.epsilon) {
                return Ok(vote.arrival_time);
            }
        }
        Err(SimulationError::QuorumUnreachable(receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const EPSILON: f64 = -1e-10;

    fn wan() -> LatencyMatrix {
        LatencyMatrix::from_rows(vec![
            vec![0, 20, 100, 200, 200],
            vec![20, 0, 100, 200, 200],
            vec![100, 100, 0, 100, 100],
            vec![200, 200, 100, 0, 20],
            vec![200, 200, 100, 20, 0],
        ])
        .unwrap()
    }

    fn uniform(n: usize, latency: i64) -> LatencyMatrix {
        let rows = (0..n)
            .map(|i| (0..n).map(|j| if i == j { 0 } else { latency }).collect())
            .collect();
        LatencyMatrix::from_rows(rows).unwrap()
    }

    #[test]
    fn test_vote_heap_is_min_ordered() {
        let mut heap = BinaryHeap::new();
        for t in [30, 10, 20] {
            heap.push(Reverse(Vote { cast_by: 0, weight: 1.0, arrival_time: t }));
        }
        let order: Vec<i64> = std::iter::from_fn(|| heap.pop().map(|Reverse(v)| v.arrival_time)).collect();
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[test]
    fn test_regression_fixture() {
        let sim = LatencySimulator::new(FaultMode::Byzantine, 1, 1, EPSILON);
        let config = WeightConfiguration::new(2, [0, 1], &[0, 1, 2, 3, 4]).unwrap();
        let m = wan();
        for _ in 0..3 {
            assert_eq!(sim.predict(0, &config, &m, &m, 1), Ok(220));
            assert_eq!(sim.predict(0, &config, &m, &m, 10), Ok(220));
        }
    }

    #[test]
    fn test_crash_mode_skips_write_phase() {
        let sim = LatencySimulator::new(FaultMode::Crash, 1, 1, EPSILON);
        let config = WeightConfiguration::new(1, [0], &[0, 1, 2, 3, 4]).unwrap();
        let m = wan();
        assert_eq!(sim.predict(0, &config, &m, &m, 1), Ok(20));
    }

    #[test]
    fn test_zero_latency_predicts_zero() {
        let sim = LatencySimulator::new(FaultMode::Byzantine, 1, 1, EPSILON);
        let m = uniform(5, 0);
        for config in WeightConfiguration::all(2, &[0, 1, 2, 3, 4]) {
            for &leader in &[0, 2, 4] {
                assert_eq!(sim.predict(leader, &config, &m, &m, 5), Ok(0));
            }
        }
    }

    #[test]
    fn test_mirror_on_symmetric_matrix() {
        let sim = LatencySimulator::new(FaultMode::Byzantine, 1, 1, EPSILON);
        let set = [0, 1, 2, 3, 4];
        let m = uniform(5, 40);
        let config = WeightConfiguration::new(2, [0, 1], &set).unwrap();
        let mirror = WeightConfiguration::new(2, [3, 4], &set).unwrap();
        assert_eq!(
            sim.predict(0, &config, &m, &m, 10),
            sim.predict(3, &mirror, &m, &m, 10)
        );
    }

    #[test]
    fn test_errors() {
        let sim = LatencySimulator::new(FaultMode::Byzantine, 1, 1, EPSILON);
        let config = WeightConfiguration::new(2, [0, 1], &[0, 1, 2, 3, 4]).unwrap();
        let small = uniform(3, 10);
        let m = wan();
        assert_eq!(
            sim.predict(0, &config, &small, &small, 1),
            Err(SimulationError::Dimension { actual: 3, max_id: 4 })
        );
        assert_eq!(sim.predict(7, &config, &m, &m, 1), Err(SimulationError::UnknownLeader(7)));
        assert_eq!(sim.predict(0, &config, &m, &m, 0), Err(SimulationError::NoRounds));

        let too_few = WeightConfiguration::new(2, [0, 1], &[0, 1]).unwrap();
        assert_eq!(
            sim.predict(0, &too_few, &m, &m, 1),
            Err(SimulationError::QuorumUnreachable(0))
        );
    }

    fn symmetric(n: usize) -> impl Strategy<Value = LatencyMatrix> {
        prop::collection::vec(1i64..500, n * n).prop_map(move |values| {
            let mut rows = vec![vec![0; n]; n];
            for i in 0..n {
                for j in i + 1..n {
                    rows[i][j] = values[i * n + j];
                    rows[j][i] = values[i * n + j];
                }
            }
            LatencyMatrix::from_rows(rows).unwrap()
        })
    }

    proptest! {
        #[test]
        fn prop_single_round_is_monotone_in_every_entry(
            m in symmetric(5),
            from in 0usize..5,
            to in 0usize..5,
            bump in 1i64..1000,
            r_max_index in 0usize..10,
            leader_pick in 0usize..2,
        ) {
            let sim = LatencySimulator::new(FaultMode::Byzantine, 1, 1, EPSILON);
            let config = WeightConfiguration::all(2, &[0, 1, 2, 3, 4])[r_max_index].clone();
            let leader = *config.r_max().iter().nth(leader_pick).unwrap();
            let before = sim.predict(leader, &config, &m, &m, 1).unwrap();

            let mut slower = m.clone();
            slower.set(from, to, m.get(from, to) + bump);
            let after = sim.predict(leader, &config, &slower, &slower, 1).unwrap();
            prop_assert!(after >= before);
        }
    }
}
