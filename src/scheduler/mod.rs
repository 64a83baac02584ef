//! Rank engine.
//!
//! Maps `{packet, flow state, global scalars, discipline}` to `{rank, updated state}`. The
//! per-discipline arithmetic lives in [`strict_priority`], [`drr`] and [`wfq`]; each takes
//! mutable references to the state it owns and applies its updates in place.
//!
//! [`RankEngine::compute`] runs a discipline against copies of the stored state and returns a
//! [`RankOutcome`] that carries the staged updates. Nothing reaches the [`FlowStateStore`] until
//! the outcome is committed, so a computation aborted by a reset leaves no trace and a failed
//! computation never mutates state.

pub mod drr;
pub mod strict_priority;
pub mod wfq;

use crate::discipline::Discipline;
use crate::error::{ConfigurationError, Counter, SchedError};
use crate::flow_state::{FlowState, FlowStateStore, GlobalSchedulerState};
use crate::packet::PacketDescriptor;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// What happens when a scheduling counter exceeds `u64::MAX`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Reject the packet with [`SchedError::CounterOverflow`]; state is left untouched.
    #[default]
    Reject,
    /// Clamp at `u64::MAX`. Counters stay monotonic but stop advancing.
    Saturate,
    /// Wrap modulo 2^64. Monotonicity no longer holds past the wrap point.
    Wrap,
}

/// Counter arithmetic under an [`OverflowPolicy`].
#[derive(Debug, Clone, Copy)]
pub struct Arith {
    policy: OverflowPolicy,
    flow_id: u16,
}

impl Arith {
    pub fn new(policy: OverflowPolicy, flow_id: u16) -> Self {
        Arith { policy, flow_id }
    }

    fn overflow(&self, counter: Counter) -> SchedError {
        SchedError::CounterOverflow {
            counter,
            flow_id: self.flow_id,
        }
    }

    pub fn add(&self, a: u64, b: u64, counter: Counter) -> Result<u64, SchedError> {
        match self.policy {
            OverflowPolicy::Reject => a.checked_add(b).ok_or_else(|| self.overflow(counter)),
            OverflowPolicy::Saturate => Ok(a.saturating_add(b)),
            OverflowPolicy::Wrap => Ok(a.wrapping_add(b)),
        }
    }

    pub fn sub(&self, a: u64, b: u64, counter: Counter) -> Result<u64, SchedError> {
        match self.policy {
            OverflowPolicy::Reject => a.checked_sub(b).ok_or_else(|| self.overflow(counter)),
            OverflowPolicy::Saturate => Ok(a.saturating_sub(b)),
            OverflowPolicy::Wrap => Ok(a.wrapping_sub(b)),
        }
    }

    pub fn mul(&self, a: u64, b: u64, counter: Counter) -> Result<u64, SchedError> {
        match self.policy {
            OverflowPolicy::Reject => a.checked_mul(b).ok_or_else(|| self.overflow(counter)),
            OverflowPolicy::Saturate => Ok(a.saturating_mul(b)),
            OverflowPolicy::Wrap => Ok(a.wrapping_mul(b)),
        }
    }
}

/// Result of one rank computation, with its state updates staged but not yet applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankOutcome {
    pub discipline: Discipline,
    pub flow_id: u16,
    pub rank: u64,
    /// DRR only.
    pub virtual_round_id: Option<u64>,
    flow_update: Option<FlowState>,
    global_update: Option<GlobalSchedulerState>,
}

impl RankOutcome {
    /// Apply the staged updates. Only DRR/WFQ outcomes carry any.
    pub fn commit(&self, store: &mut FlowStateStore) -> Result<(), ConfigurationError> {
        if let Some(flow) = self.flow_update {
            store.set(self.flow_id, flow)?;
        }
        if let Some(global) = self.global_update {
            store.set_global(global);
        }
        Ok(())
    }

    pub fn flow_update(&self) -> Option<FlowState> {
        self.flow_update
    }

    pub fn global_update(&self) -> Option<GlobalSchedulerState> {
        self.global_update
    }
}

/// Discipline dispatcher over a [`FlowStateStore`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RankEngine {
    policy: OverflowPolicy,
}

impl RankEngine {
    pub fn new(policy: OverflowPolicy) -> Self {
        RankEngine { policy }
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Validate the flow configuration the discipline depends on.
    ///
    /// Runs before any arithmetic so the disciplines only ever see valid inputs.
    pub fn validate(
        &self,
        discipline: Discipline,
        packet: &PacketDescriptor,
        store: &FlowStateStore,
    ) -> Result<(), ConfigurationError> {
        match discipline {
            Discipline::StrictPriority => Ok(()),
            Discipline::DeficitRoundRobin => store.drr_quantum(packet.flow_id).map(|_| ()),
            Discipline::WeightedFairQueueing => store.active_weight(packet.flow_id).map(|_| ()),
        }
    }

    /// Compute a rank against the current store contents without mutating them.
    ///
    /// Validation runs first, so an unknown flow, an inactive flow or a quantum below the
    /// minimum packet size is reported before any arithmetic. DRR and WFQ work on copies of
    /// the flow entry and the global scalars; the new values travel in the returned outcome
    /// until [`RankOutcome::commit`] writes them back.
    ///
    /// # Arguments
    /// * `discipline` - Rank discipline to apply
    /// * `packet` - Packet metadata as read back from data memory
    /// * `store` - Flow table and global scalars the discipline reads
    ///
    /// # Returns
    /// The rank, the DRR virtual round id when applicable, and the staged state updates. Fails
    /// with `SchedError::Configuration` on invalid flow configuration, or
    /// `SchedError::CounterOverflow` under [`OverflowPolicy::Reject`]
    pub fn compute(
        &self,
        discipline: Discipline,
        packet: &PacketDescriptor,
        store: &FlowStateStore,
    ) -> Result<RankOutcome, SchedError> {
        self.validate(discipline, packet, store)?;
        let arith = Arith::new(self.policy, packet.flow_id);

        let outcome = match discipline {
            Discipline::StrictPriority => RankOutcome {
                discipline,
                flow_id: packet.flow_id,
                rank: strict_priority::rank(packet),
                virtual_round_id: None,
                flow_update: None,
                global_update: None,
            },
            Discipline::DeficitRoundRobin => {
                let mut flow = store.get(packet.flow_id)?;
                let mut global = store.global();
                let params = drr::DrrParams {
                    flows: store.len() as u64,
                    min_packet_size: store.min_packet_size(),
                };
                let result = drr::rank(packet, &mut flow, &mut global, params, arith)?;
                RankOutcome {
                    discipline,
                    flow_id: packet.flow_id,
                    rank: result.rank,
                    virtual_round_id: Some(result.virtual_round_id),
                    flow_update: Some(flow),
                    global_update: Some(global),
                }
            }
            Discipline::WeightedFairQueueing => {
                let mut flow = store.get(packet.flow_id)?;
                let mut global = store.global();
                let rank = wfq::rank(packet, &mut flow, &mut global, arith)?;
                RankOutcome {
                    discipline,
                    flow_id: packet.flow_id,
                    rank,
                    virtual_round_id: None,
                    flow_update: Some(flow),
                    global_update: Some(global),
                }
            }
        };

        trace!(
            discipline = %discipline,
            flow_id = packet.flow_id,
            rank = outcome.rank,
            "rank computed"
        );
        Ok(outcome)
    }

    /// Compute and immediately commit.
    pub fn apply(
        &self,
        discipline: Discipline,
        packet: &PacketDescriptor,
        store: &mut FlowStateStore,
    ) -> Result<RankOutcome, SchedError> {
        let outcome = self.compute(discipline, packet, store)?;
        outcome.commit(store)?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> FlowStateStore {
        let mut store = FlowStateStore::new(8, 64);
        store.set_weight(1, 128).unwrap();
        store
    }

    #[test]
    fn compute_does_not_mutate_store() {
        let store = store();
        let engine = RankEngine::default();
        let packet = PacketDescriptor::new(1, 64);
        let outcome = engine
            .compute(Discipline::DeficitRoundRobin, &packet, &store)
            .unwrap();
        assert_eq!(store.get(1).unwrap().service_counter, 0);
        assert_eq!(outcome.flow_update().unwrap().service_counter, 64);
    }

    #[test]
    fn apply_commits_updates() {
        let mut store = store();
        store.set_weight(3, 2).unwrap();
        let engine = RankEngine::default();
        let packet = PacketDescriptor::new(3, 64);
        engine
            .apply(Discipline::WeightedFairQueueing, &packet, &mut store)
            .unwrap();
        assert_eq!(store.get(3).unwrap().last_finish_time, 32);
        assert_eq!(store.global().virtual_time, 32);
        // DRR scalars are untouched by WFQ.
        assert_eq!(store.global().dequeue_cycle, 0);
    }

    #[test]
    fn invalid_flow_rejected_without_mutation() {
        let mut store = store();
        let engine = RankEngine::default();
        let before = store.flows().to_vec();
        let err = engine
            .apply(Discipline::DeficitRoundRobin, &PacketDescriptor::new(2, 64), &mut store)
            .unwrap_err();
        assert_eq!(
            err,
            SchedError::Configuration(ConfigurationError::InactiveFlow { flow_id: 2 })
        );
        assert_eq!(store.flows(), &before[..]);
    }

    #[test]
    fn strict_priority_ignores_flow_configuration() {
        let store = FlowStateStore::new(1, 64);
        let engine = RankEngine::default();
        let packet = PacketDescriptor::new(0, 64).with_priority(3);
        let outcome = engine
            .compute(Discipline::StrictPriority, &packet, &store)
            .unwrap();
        assert_eq!(outcome.rank, 3);
        assert!(outcome.flow_update().is_none());
    }

    #[test]
    fn arith_policies() {
        let reject = Arith::new(OverflowPolicy::Reject, 4);
        assert_eq!(
            reject.add(u64::MAX, 1, Counter::FinishTime),
            Err(SchedError::CounterOverflow {
                counter: Counter::FinishTime,
                flow_id: 4
            })
        );
        let saturate = Arith::new(OverflowPolicy::Saturate, 4);
        assert_eq!(saturate.add(u64::MAX, 1, Counter::FinishTime), Ok(u64::MAX));
        let wrap = Arith::new(OverflowPolicy::Wrap, 4);
        assert_eq!(wrap.add(u64::MAX, 2, Counter::FinishTime), Ok(1));
    }
}
