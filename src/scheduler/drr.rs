//! Deficit Round Robin rank computation
//!
//! Each flow accumulates the bytes it has sent in a service counter. Dividing that counter by the
//! flow's quantum yields the virtual round the packet belongs to; the rank places the packet in
//! a per-round slot so flows with larger quanta fit more packets into each round.
//!
//! Algorithm (flow `f`, quantum `Q`, `N` flows, minimum packet size `MIN`):
//! 1. `pkts_per_round = N * (Q / MIN)`
//! 2. `candidate = max(service_counter[f], dequeue_cycle * Q)`
//! 3. `service_counter[f] = candidate + length`
//! 4. `virtual_round_id = (service_counter[f] - 1) / Q`
//! 5. `rank = f + pkts_per_round * virtual_round_id`
//! 6. `dequeue_cycle = max(dequeue_cycle, virtual_round_id)`
//!
//! Step 2 lets an idle flow catch up to the current round instead of spending stale credit.

use super::Arith;
use crate::error::{ConfigurationError, Counter, SchedError};
use crate::flow_state::{FlowState, GlobalSchedulerState};
use crate::packet::PacketDescriptor;

/// Node-wide constants the DRR formula depends on.
#[derive(Debug, Clone, Copy)]
pub struct DrrParams {
    /// Number of configured flows (N).
    pub flows: u64,
    /// Minimum packet size floor (MIN).
    pub min_packet_size: u32,
}

/// Rank plus the virtual round it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrrRank {
    pub rank: u64,
    pub virtual_round_id: u64,
}

/// Compute the DRR rank of `packet`, updating `flow.service_counter` and
/// `global.dequeue_cycle` in place.
///
/// On error neither `flow` nor `global` is modified.
pub fn rank(
    packet: &PacketDescriptor,
    flow: &mut FlowState,
    global: &mut GlobalSchedulerState,
    params: DrrParams,
    arith: Arith,
) -> Result<DrrRank, SchedError> {
    let quantum = u64::from(flow.weight);
    let min = u64::from(params.min_packet_size);
    if quantum == 0 {
        return Err(ConfigurationError::InactiveFlow {
            flow_id: packet.flow_id,
        }
        .into());
    }
    let credit = if min == 0 { 0 } else { quantum / min };
    if credit == 0 {
        return Err(ConfigurationError::QuantumBelowFloor {
            flow_id: packet.flow_id,
            quantum: flow.weight,
            min_packet_size: params.min_packet_size,
        }
        .into());
    }

    let pkts_per_round = arith.mul(params.flows, credit, Counter::Rank)?;

    let round_floor = arith.mul(global.dequeue_cycle, quantum, Counter::ServiceCounter)?;
    let candidate = flow.service_counter.max(round_floor);
    let service_counter = arith.add(candidate, u64::from(packet.length), Counter::ServiceCounter)?;

    let virtual_round_id = arith.sub(service_counter, 1, Counter::ServiceCounter)? / quantum;

    let slot = arith.mul(pkts_per_round, virtual_round_id, Counter::Rank)?;
    let rank = arith.add(u64::from(packet.flow_id), slot, Counter::Rank)?;

    flow.service_counter = service_counter;
    global.dequeue_cycle = global.dequeue_cycle.max(virtual_round_id);

    Ok(DrrRank {
        rank,
        virtual_round_id,
    })
}
