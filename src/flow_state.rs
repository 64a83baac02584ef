//! Per-flow and global scheduling state.
//!
//! The store is plain data with O(1) indexed access. It is mutated only through rank
//! computations committed by the node controller and through weight reconfiguration applied
//! while no computation is in flight. Flow identifiers outside the configured table are a
//! configuration error, never clamped.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};

/// Scheduling state for a single flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowState {
    /// DRR quantum / WFQ weight. Zero marks the flow inactive.
    pub weight: u32,
    /// DRR byte accumulator, non-decreasing.
    pub service_counter: u64,
    /// WFQ finish time of the flow's last packet, non-decreasing.
    pub last_finish_time: u64,
}

/// Global scalars shared by every flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSchedulerState {
    /// DRR: largest virtual round observed so far.
    pub dequeue_cycle: u64,
    /// WFQ: largest finish time observed so far.
    pub virtual_time: u64,
}

/// Fixed-size flow table plus the global scalars.
#[derive(Debug, Clone)]
pub struct FlowStateStore {
    flows: Vec<FlowState>,
    global: GlobalSchedulerState,
    min_packet_size: u32,
}

impl FlowStateStore {
    /// Create a table of `flows` inactive flows (weight 0, counters 0).
    pub fn new(flows: usize, min_packet_size: u32) -> Self {
        FlowStateStore {
            flows: vec![FlowState::default(); flows],
            global: GlobalSchedulerState::default(),
            min_packet_size,
        }
    }

    /// Number of configured flows (N).
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn min_packet_size(&self) -> u32 {
        self.min_packet_size
    }

    fn slot(&self, flow_id: u16) -> Result<usize, ConfigurationError> {
        let index = usize::from(flow_id);
        if index < self.flows.len() {
            Ok(index)
        } else {
            Err(ConfigurationError::UnknownFlow {
                flow_id,
                flows: self.flows.len(),
            })
        }
    }

    /// Read the state of `flow_id`. Valid range: `0..len()`.
    pub fn get(&self, flow_id: u16) -> Result<FlowState, ConfigurationError> {
        let index = self.slot(flow_id)?;
        Ok(self.flows[index])
    }

    /// Overwrite the state of `flow_id`. Valid range: `0..len()`.
    pub fn set(&mut self, flow_id: u16, state: FlowState) -> Result<(), ConfigurationError> {
        let index = self.slot(flow_id)?;
        self.flows[index] = state;
        Ok(())
    }

    /// Update only the weight/quantum of `flow_id`, keeping its counters.
    pub fn set_weight(&mut self, flow_id: u16, weight: u32) -> Result<(), ConfigurationError> {
        let index = self.slot(flow_id)?;
        self.flows[index].weight = weight;
        Ok(())
    }

    /// Weight of an active flow; weight 0 is rejected.
    pub fn active_weight(&self, flow_id: u16) -> Result<u32, ConfigurationError> {
        let state = self.get(flow_id)?;
        if state.weight == 0 {
            return Err(ConfigurationError::InactiveFlow { flow_id });
        }
        Ok(state.weight)
    }

    /// DRR quantum of `flow_id`; must be active and at least the minimum packet size so that
    /// `quantum / min_packet_size` grants non-zero credit.
    pub fn drr_quantum(&self, flow_id: u16) -> Result<u32, ConfigurationError> {
        let quantum = self.active_weight(flow_id)?;
        if self.min_packet_size == 0 || quantum < self.min_packet_size {
            return Err(ConfigurationError::QuantumBelowFloor {
                flow_id,
                quantum,
                min_packet_size: self.min_packet_size,
            });
        }
        Ok(quantum)
    }

    pub fn global(&self) -> GlobalSchedulerState {
        self.global
    }

    pub fn set_global(&mut self, global: GlobalSchedulerState) {
        self.global = global;
    }

    pub fn flows(&self) -> &[FlowState] {
        &self.flows
    }

    /// Cold reset: every flow back to weight 0 / counters 0, global scalars to 0.
    pub fn clear(&mut self) {
        self.flows.iter_mut().for_each(|flow| *flow = FlowState::default());
        self.global = GlobalSchedulerState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flows_start_inactive() {
        let store = FlowStateStore::new(8, 64);
        assert_eq!(store.len(), 8);
        assert!(store.flows().iter().all(|f| *f == FlowState::default()));
        assert_eq!(store.global(), GlobalSchedulerState::default());
    }

    #[test]
    fn out_of_range_flow_is_configuration_error() {
        let mut store = FlowStateStore::new(8, 64);
        assert_eq!(
            store.get(8),
            Err(ConfigurationError::UnknownFlow { flow_id: 8, flows: 8 })
        );
        assert!(store.set_weight(100, 128).is_err());
    }

    #[test]
    fn quantum_checks() {
        let mut store = FlowStateStore::new(4, 64);
        assert_eq!(
            store.drr_quantum(1),
            Err(ConfigurationError::InactiveFlow { flow_id: 1 })
        );
        store.set_weight(1, 32).unwrap();
        assert_eq!(
            store.drr_quantum(1),
            Err(ConfigurationError::QuantumBelowFloor {
                flow_id: 1,
                quantum: 32,
                min_packet_size: 64
            })
        );
        // WFQ only needs a positive weight.
        assert_eq!(store.active_weight(1), Ok(32));
        store.set_weight(1, 128).unwrap();
        assert_eq!(store.drr_quantum(1), Ok(128));
    }

    #[test]
    fn clear_resets_everything() {
        let mut store = FlowStateStore::new(2, 64);
        store
            .set(
                0,
                FlowState {
                    weight: 128,
                    service_counter: 10,
                    last_finish_time: 5,
                },
            )
            .unwrap();
        store.set_global(GlobalSchedulerState {
            dequeue_cycle: 3,
            virtual_time: 7,
        });
        store.clear();
        assert_eq!(store.get(0).unwrap(), FlowState::default());
        assert_eq!(store.global(), GlobalSchedulerState::default());
    }
}
