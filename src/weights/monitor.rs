use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::common::lock;

use super::{
    configuration::ReplicaId,
    latency::{LatencyMatrix, MISSING},
};

/*
    Every replica measures its own one-way latency to the others from the
    round trips of consensus traffic, then disseminates that vector through
    the ordered broadcast. Because every replica applies the same vectors in
    the same order, they all hold the same matrices when the optimizer runs.
*/

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MeasurementError {
    #[error("measurement payload of {0} bytes is too short")]
    Truncated(usize),

    #[error("measurement vectors have {write} and {propose} entries, expected {expected}")]
    Length {
        write: usize,
        propose: usize,
        expected: usize,
    },
}

/// Send/receive timestamps of one message class towards every replica,
/// kept for the last `window` instances.
#[derive(Debug)]
pub struct LatencyProbe {
    window: u64,
    sent: Vec<BTreeMap<u64, i64>>,
    received: Vec<BTreeMap<u64, i64>>,
}

impl LatencyProbe {
    pub fn new(n: usize, window: u64) -> Self {
        LatencyProbe {
            window: window.max(1),
            sent: vec![BTreeMap::new(); n],
            received: vec![BTreeMap::new(); n],
        }
    }

    pub fn record_sent(&mut self, replica: ReplicaId, instance: u64, timestamp: i64) {
        let Some(sent) = self.sent.get_mut(replica) else {
            return;
        };
        sent.insert(instance, timestamp);

        let received = &mut self.received[replica];
        while let Some((&oldest, _)) = sent.first_key_value() {
            if oldest.saturating_add(self.window) > instance {
                break;
            }
            sent.pop_first();
            received.remove(&oldest);
        }
    }

    /// Ignored unless a matching send was recorded.
    pub fn record_received(&mut self, replica: ReplicaId, instance: u64, timestamp: i64) {
        let matched = self
            .sent
            .get(replica)
            .is_some_and(|sent| sent.contains_key(&instance));
        if matched {
            self.received[replica].insert(instance, timestamp);
        }
    }

    /// Median one-way latency (half the round trip) to every replica over
    /// the `window` instances ending at the newest one recorded.
    pub fn latency_vector(&self, me: ReplicaId) -> Vec<i64> {
        let newest = self
            .sent
            .iter()
            .filter_map(|sent| sent.keys().next_back().copied())
            .max()
            .unwrap_or(0);
        let range = newest.saturating_add(1).saturating_sub(self.window)..=newest;
        let mut vector = Vec::with_capacity(self.sent.len());

        for (sent, received) in self.sent.iter().zip(&self.received) {
            let mut samples: Vec<i64> = sent
                .range(range.clone())
                .filter_map(|(instance, sent_at)| {
                    received
                        .get(instance)
                        .map(|received_at| ((received_at - sent_at) / 2).max(0))
                })
                .collect();
            samples.sort_unstable();
            vector.push(samples.get(samples.len() / 2).copied().unwrap_or(MISSING));
        }
        if let Some(own) = vector.get_mut(me) {
            *own = 0;
        }
        vector
    }
}

/// One replica's latency vectors as handed to the ordered broadcast.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Measurements {
    pub sender: ReplicaId,
    pub write: Vec<i64>,
    pub propose: Vec<i64>,
}

impl Measurements {
    /// `sender | n | write[n] | propose[n]`, all big-endian u64/i64.
    pub fn to_bytes(&self) -> Vec<u8> {
        let n = self.write.len();
        let mut bytes = Vec::with_capacity(16 + 16 * n);
        bytes.extend_from_slice(&(self.sender as u64).to_be_bytes());
        bytes.extend_from_slice(&(n as u64).to_be_bytes());
        for value in self.write.iter().chain(&self.propose) {
            bytes.extend_from_slice(&value.to_be_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MeasurementError> {
        let mut words = bytes.chunks_exact(8).map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            word
        });
        let mut next = || words.next().ok_or(MeasurementError::Truncated(bytes.len()));

        let sender = u64::from_be_bytes(next()?) as ReplicaId;
        let n = u64::from_be_bytes(next()?) as usize;
        if bytes.len() != 16 + 16 * n {
            return Err(MeasurementError::Truncated(bytes.len()));
        }

        let mut write = Vec::with_capacity(n);
        for _ in 0..n {
            write.push(i64::from_be_bytes(next()?));
        }
        let mut propose = Vec::with_capacity(n);
        for _ in 0..n {
            propose.push(i64::from_be_bytes(next()?));
        }
        Ok(Measurements {
            sender,
            write,
            propose,
        })
    }
}

#[derive(Debug)]
struct MonitorState {
    propose_probe: LatencyProbe,
    write_probe: LatencyProbe,
    propose: LatencyMatrix,
    write: LatencyMatrix,
}

/// Latency bookkeeping for one replica.
#[derive(Debug)]
pub struct Monitor {
    me: ReplicaId,
    n: usize,
    use_dummy_propose: bool,
    probe_overhead: f64,
    state: Mutex<MonitorState>,
}

impl Monitor {
    pub fn new(me: ReplicaId, n: usize, window: u64, use_dummy_propose: bool) -> Self {
        Monitor {
            me,
            n,
            use_dummy_propose,
            probe_overhead: 1.0,
            state: Mutex::new(MonitorState {
                propose_probe: LatencyProbe::new(n, window),
                write_probe: LatencyProbe::new(n, window),
                propose: LatencyMatrix::new(n),
                write: LatencyMatrix::new(n),
            }),
        }
    }

    /// Dummy PROPOSE probes per `n` instances, spread over the replicas.
    pub fn with_probe_overhead(mut self, overhead: f64) -> Self {
        self.probe_overhead = overhead;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        lock(&self.state)
    }

    pub fn use_dummy_propose(&self) -> bool {
        self.use_dummy_propose
    }

    /// Whether this replica sends a dummy PROPOSE in instance `cid`. Replica
    /// ids shift the phase so the probes of different replicas interleave.
    pub fn should_probe(&self, cid: u64) -> bool {
        if !self.use_dummy_propose {
            return false;
        }
        let slot = |c: f64| (c * self.probe_overhead / self.n as f64).floor();
        let c = cid as f64 + self.me as f64;
        slot(c) != slot(c - 1.0)
    }

    pub fn write_sent(&self, to: ReplicaId, instance: u64, timestamp: i64) {
        self.lock().write_probe.record_sent(to, instance, timestamp);
    }

    pub fn write_echoed(&self, from: ReplicaId, instance: u64, timestamp: i64) {
        self.lock().write_probe.record_received(from, instance, timestamp);
    }

    pub fn propose_sent(&self, to: ReplicaId, instance: u64, timestamp: i64) {
        self.lock().propose_probe.record_sent(to, instance, timestamp);
    }

    pub fn propose_echoed(&self, from: ReplicaId, instance: u64, timestamp: i64) {
        self.lock().propose_probe.record_received(from, instance, timestamp);
    }

    /// This replica's freshest vectors, ready for dissemination.
    pub fn measurements(&self) -> Measurements {
        let state = self.lock();
        let write = state.write_probe.latency_vector(self.me);
        let propose = state.propose_probe.latency_vector(self.me);
        Measurements {
            sender: self.me,
            write,
            propose,
        }
    }

    /// Applies a vector delivered by the ordered broadcast as row `sender`.
    pub fn on_ordered_measurements(&self, measurements: &Measurements) -> Result<(), MeasurementError> {
        if measurements.sender >= self.n
            || measurements.write.len() != self.n
            || measurements.propose.len() != self.n
        {
            warn!(sender = measurements.sender, "Dropping malformed latency measurements");
            return Err(MeasurementError::Length {
                write: measurements.write.len(),
                propose: measurements.propose.len(),
                expected: self.n,
            });
        }
        let mut state = self.lock();
        state.write.set_row(measurements.sender, &measurements.write);
        state.propose.set_row(measurements.sender, &measurements.propose);
        debug!(sender = measurements.sender, "Installed latency measurements");
        Ok(())
    }

    /// Forgets every installed row; called once a search result was applied.
    pub fn reset_matrices(&self) {
        let mut state = self.lock();
        state.propose = LatencyMatrix::new(self.n);
        state.write = LatencyMatrix::new(self.n);
        debug!("Reset latency matrices");
    }

    /// Sanitized (propose, write) matrices. Without dummy proposes the
    /// PROPOSE latencies are approximated by the WRITE latencies.
    pub fn matrices(&self) -> (LatencyMatrix, LatencyMatrix) {
        let state = self.lock();
        let write = state.write.sanitize();
        let propose = if self.use_dummy_propose {
            state.propose.sanitize()
        } else {
            write.clone()
        };
        (propose, write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_median_of_half_round_trips() {
        let mut probe = LatencyProbe::new(3, 100);
        for (instance, rtt) in [(0, 20), (1, 40), (2, 60)] {
            probe.record_sent(1, instance, 1000);
            probe.record_received(1, instance, 1000 + rtt);
        }
        probe.record_received(2, 5, 77);

        assert_eq!(probe.latency_vector(0), vec![0, 20, MISSING]);
    }

    #[test]
    fn test_probe_window_follows_newest_instance() {
        let mut probe = LatencyProbe::new(2, 10);
        probe.record_sent(1, 3, 0);
        probe.record_received(1, 3, 8);
        assert_eq!(probe.latency_vector(0), vec![0, 4]);
        assert_eq!(probe.latency_vector(0), vec![0, 4]);

        probe.record_sent(1, 12, 0);
        probe.record_received(1, 12, 30);
        assert_eq!(probe.latency_vector(0), vec![0, 15]);

        // Instance 3 falls out of the window, 12 is still in it.
        probe.record_sent(1, 20, 0);
        assert_eq!(probe.latency_vector(0), vec![0, 15]);

        probe.record_sent(1, 40, 0);
        assert_eq!(probe.latency_vector(0), vec![0, MISSING]);
        probe.record_received(1, 12, 50);
        assert_eq!(probe.latency_vector(0), vec![0, MISSING]);
    }

    #[test]
    fn test_measurements_codec() {
        let m = Measurements {
            sender: 2,
            write: vec![0, 15, MISSING],
            propose: vec![3, 0, 9],
        };
        assert_eq!(Measurements::from_bytes(&m.to_bytes()), Ok(m.clone()));

        let bytes = m.to_bytes();
        assert_eq!(
            Measurements::from_bytes(&bytes[..bytes.len() - 3]),
            Err(MeasurementError::Truncated(bytes.len() - 3))
        );
        assert_eq!(Measurements::from_bytes(&[1, 2]), Err(MeasurementError::Truncated(2)));
    }

    #[test]
    fn test_monitor_assembles_sanitized_matrices() {
        let monitor = Monitor::new(0, 3, 100, false);
        monitor
            .on_ordered_measurements(&Measurements {
                sender: 0,
                write: vec![0, 10, 50],
                propose: vec![0, 0, 0],
            })
            .unwrap();
        monitor
            .on_ordered_measurements(&Measurements {
                sender: 1,
                write: vec![12, 0, 30],
                propose: vec![0, 0, 0],
            })
            .unwrap();

        let (propose, write) = monitor.matrices();
        assert_eq!(write.get(0, 1), 12);
        assert_eq!(write.get(1, 2), MISSING);
        assert_eq!(propose, write);

        assert!(monitor
            .on_ordered_measurements(&Measurements {
                sender: 5,
                write: vec![0; 3],
                propose: vec![0; 3],
            })
            .is_err());

        monitor.reset_matrices();
        let (_, write) = monitor.matrices();
        assert_eq!(write.get(0, 1), MISSING);
    }

    #[test]
    fn test_probe_pacing() {
        let probes = |me: ReplicaId, overhead: f64| -> Vec<u64> {
            let monitor = Monitor::new(me, 4, 100, true).with_probe_overhead(overhead);
            (1..=12).filter(|&cid| monitor.should_probe(cid)).collect()
        };
        assert_eq!(probes(0, 1.0), vec![4, 8, 12]);
        assert_eq!(probes(1, 1.0), vec![3, 7, 11]);
        assert_eq!(probes(2, 4.0).len(), 12);

        let disabled = Monitor::new(0, 4, 100, false);
        assert!(!(1..=12).any(|cid| disabled.should_probe(cid)));
    }
}
