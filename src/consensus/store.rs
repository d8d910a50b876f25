use std::collections::BTreeMap;

use tracing::debug;

use super::epoch::Decision;

/// Decided instances, kept `gc_delay` instances past the newest decision so
/// late messages for them can still be recognised.
pub struct DecisionStore {
    decisions: BTreeMap<u64, Decision>,
    gc_delay: u64,
}

impl DecisionStore {
    pub fn new(gc_delay: u64) -> Self {
        DecisionStore {
            decisions: BTreeMap::new(),
            gc_delay,
        }
    }

    pub fn archive(&mut self, decision: Decision) {
        self.decisions.insert(decision.cid, decision);
    }

    pub fn get(&self, cid: u64) -> Option<&Decision> {
        self.decisions.get(&cid)
    }

    pub fn last_decided(&self) -> Option<u64> {
        self.decisions.keys().next_back().copied()
    }

    /// Lowest cid still retained.
    pub fn low_watermark(&self) -> u64 {
        self.last_decided()
            .map_or(0, |last| last.saturating_sub(self.gc_delay))
    }

    /// Drops decisions below the low watermark and returns it.
    pub fn collect_garbage(&mut self) -> u64 {
        let low = self.low_watermark();
        let before = self.decisions.len();
        self.decisions = self.decisions.split_off(&low);
        let dropped = before - self.decisions.len();
        if dropped > 0 {
            debug!(low, dropped, "Collected decided instances");
        }
        low
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }
}
