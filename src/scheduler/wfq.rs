//! Weighted Fair Queueing rank computation
//!
//! Classic virtual start/finish recurrence. The rank is the packet's virtual finish time:
//! 1. `start = max(last_finish_time[f], virtual_time)`
//! 2. `finish = start + length / weight[f]`
//! 3. `last_finish_time[f] = finish`, `virtual_time = finish`
//! 4. `rank = finish`

use super::Arith;
use crate::error::{ConfigurationError, Counter, SchedError};
use crate::flow_state::{FlowState, GlobalSchedulerState};
use crate::packet::PacketDescriptor;

/// Compute the WFQ rank of `packet`, updating `flow.last_finish_time` and
/// `global.virtual_time` in place. On error neither is modified.
pub fn rank(
    packet: &PacketDescriptor,
    flow: &mut FlowState,
    global: &mut GlobalSchedulerState,
    arith: Arith,
) -> Result<u64, SchedError> {
    if flow.weight == 0 {
        return Err(ConfigurationError::InactiveFlow {
            flow_id: packet.flow_id,
        }
        .into());
    }

    let start = flow.last_finish_time.max(global.virtual_time);
    let cost = u64::from(packet.length) / u64::from(flow.weight);
    let finish = arith.add(start, cost, Counter::FinishTime)?;

    flow.last_finish_time = finish;
    global.virtual_time = finish;
    Ok(finish)
}
