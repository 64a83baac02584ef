//! Node counters and serialisable snapshots.
//!
//! Counters are plain atomics so they can be read from another thread (for example a stats
//! reporter) while the controller keeps ticking. Relaxed ordering is enough: they are metrics,
//! not synchronisation.

use crate::discipline::{Discipline, DisciplineTable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by the node controller.
#[derive(Debug)]
pub struct NodeMetrics {
    pub ticks: AtomicU64,
    pub admitted: AtomicU64,
    pub ranked: DisciplineTable<AtomicU64>,
    pub enqueued: AtomicU64,
    /// Packets dropped because the priority store was full.
    pub dropped_full: AtomicU64,
    /// Packets dropped because the outbound port was full.
    pub dropped_egress: AtomicU64,
    pub rejected_configuration: AtomicU64,
    pub rejected_malformed: AtomicU64,
    pub rejected_overflow: AtomicU64,
    pub forwarded: AtomicU64,
    /// Dequeue attempts that found the store empty.
    pub empty_dequeues: AtomicU64,
    pub program_writes: AtomicU64,
    pub reconfigurations: AtomicU64,
    /// Rank computations discarded by a reset before completing.
    pub aborted: AtomicU64,
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
            ranked: DisciplineTable::from_fn(|_| AtomicU64::new(0)),
            enqueued: AtomicU64::new(0),
            dropped_full: AtomicU64::new(0),
            dropped_egress: AtomicU64::new(0),
            rejected_configuration: AtomicU64::new(0),
            rejected_malformed: AtomicU64::new(0),
            rejected_overflow: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            empty_dequeues: AtomicU64::new(0),
            program_writes: AtomicU64::new(0),
            reconfigurations: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        }
    }
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl NodeMetrics {
    pub fn record_ranked(&self, discipline: Discipline) {
        bump(&self.ranked[discipline]);
    }

    /// Copy every counter into a plain snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            ticks: load(&self.ticks),
            admitted: load(&self.admitted),
            ranked: Discipline::ALL
                .iter()
                .map(|&d| (d, load(&self.ranked[d])))
                .collect(),
            enqueued: load(&self.enqueued),
            dropped_full: load(&self.dropped_full),
            dropped_egress: load(&self.dropped_egress),
            rejected_configuration: load(&self.rejected_configuration),
            rejected_malformed: load(&self.rejected_malformed),
            rejected_overflow: load(&self.rejected_overflow),
            forwarded: load(&self.forwarded),
            empty_dequeues: load(&self.empty_dequeues),
            program_writes: load(&self.program_writes),
            reconfigurations: load(&self.reconfigurations),
            aborted: load(&self.aborted),
        }
    }

    /// Zero every counter (cold reset).
    pub fn reset(&self) {
        let counters = [
            &self.ticks,
            &self.admitted,
            &self.enqueued,
            &self.dropped_full,
            &self.dropped_egress,
            &self.rejected_configuration,
            &self.rejected_malformed,
            &self.rejected_overflow,
            &self.forwarded,
            &self.empty_dequeues,
            &self.program_writes,
            &self.reconfigurations,
            &self.aborted,
        ];
        for counter in counters {
            counter.store(0, Ordering::Relaxed);
        }
        for discipline in Discipline::ALL {
            self.ranked[discipline].store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time copy of [`NodeMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub ticks: u64,
    pub admitted: u64,
    pub ranked: BTreeMap<Discipline, u64>,
    pub enqueued: u64,
    pub dropped_full: u64,
    pub dropped_egress: u64,
    pub rejected_configuration: u64,
    pub rejected_malformed: u64,
    pub rejected_overflow: u64,
    pub forwarded: u64,
    pub empty_dequeues: u64,
    pub program_writes: u64,
    pub reconfigurations: u64,
    pub aborted: u64,
}

impl MetricsSnapshot {
    /// Every packet rejected before reaching the store.
    pub fn rejected(&self) -> u64 {
        self.rejected_configuration + self.rejected_malformed + self.rejected_overflow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = NodeMetrics::default();
        bump(&metrics.admitted);
        bump(&metrics.rejected_malformed);
        metrics.record_ranked(Discipline::WeightedFairQueueing);
        metrics.record_ranked(Discipline::WeightedFairQueueing);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.admitted, 1);
        assert_eq!(snapshot.rejected(), 1);
        assert_eq!(snapshot.ranked[&Discipline::WeightedFairQueueing], 2);
        assert_eq!(snapshot.ranked[&Discipline::StrictPriority], 0);
    }

    #[test]
    fn reset_zeroes_counters() {
        let metrics = NodeMetrics::default();
        bump(&metrics.forwarded);
        metrics.record_ranked(Discipline::DeficitRoundRobin);
        metrics.reset();
        assert_eq!(metrics.snapshot(), {
            let mut zero = MetricsSnapshot::default();
            zero.ranked = Discipline::ALL.iter().map(|&d| (d, 0)).collect();
            zero
        });
    }

    #[test]
    fn snapshot_serialises_discipline_keys() {
        let metrics = NodeMetrics::default();
        metrics.record_ranked(Discipline::StrictPriority);
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"sp\":1"));
    }
}
