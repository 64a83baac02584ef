//! Word-addressed memory shared with rank programs.
//!
//! The node publishes each admitted packet's metadata words into data memory, and the rank
//! engine publishes its result there for the controller to read back. The flow tables and the
//! global scalars are mirrored into the same memory (low 32 bits) so that an external rank
//! program sees the layout it expects. The typed [`FlowStateStore`] stays authoritative.
//!
//! [`ProgramMemory`] holds the rank program image; the controller applies writes to it only
//! while no computation is in flight.

use crate::flow_state::FlowStateStore;
use crate::packet::{PacketDescriptor, METADATA_WORDS};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;
use tracing::{debug, trace};

/// Access outside the backing memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("word address {addr:#x} outside memory of {words} words")]
pub struct MemoryError {
    pub addr: usize,
    pub words: usize,
}

/// Request/response contract the node uses to reach data memory.
pub trait MemoryInterface {
    fn read_word(&self, addr: usize) -> Result<u32, MemoryError>;
    fn write_word(&mut self, addr: usize, value: u32) -> Result<(), MemoryError>;
    fn words(&self) -> usize;
}

/// Word offsets of every field the node and the rank programs exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMap {
    /// Packet metadata, [`METADATA_WORDS`] words.
    pub metadata: usize,
    /// `result+0` rank (low), `result+1` virtual round id, `result+2` rank (high).
    pub result: usize,
    pub weight_table: usize,
    pub service_counter_table: usize,
    pub finish_time_table: usize,
    pub dequeue_cycle: usize,
    pub virtual_time: usize,
}

/// Number of words written at `result`.
pub const RESULT_WORDS: usize = 3;

impl Default for RegisterMap {
    /// Layout used by the existing rank programs (byte addresses 0x100, 0x150, 0x180, 0x1D0,
    /// 0x80, 0x210, 0x208).
    fn default() -> Self {
        RegisterMap {
            metadata: 0x100 >> 2,
            result: 0x150 >> 2,
            weight_table: 0x180 >> 2,
            service_counter_table: 0x1D0 >> 2,
            finish_time_table: 0x80 >> 2,
            dequeue_cycle: 0x210 >> 2,
            virtual_time: 0x208 >> 2,
        }
    }
}

impl RegisterMap {
    fn regions(&self, flows: usize) -> [Range<usize>; 7] {
        [
            self.metadata..self.metadata + METADATA_WORDS,
            self.result..self.result + RESULT_WORDS,
            self.weight_table..self.weight_table + flows,
            self.service_counter_table..self.service_counter_table + flows,
            self.finish_time_table..self.finish_time_table + flows,
            self.dequeue_cycle..self.dequeue_cycle + 1,
            self.virtual_time..self.virtual_time + 1,
        ]
    }

    /// True when no two regions overlap for `flows` flows.
    pub fn fits(&self, flows: usize) -> bool {
        let regions = self.regions(flows);
        regions.iter().enumerate().all(|(i, a)| {
            regions[i + 1..]
                .iter()
                .all(|b| a.end <= b.start || b.end <= a.start)
        })
    }

    /// The default layout when it fits, otherwise the default fixed registers with the three
    /// flow tables relocated past the last scalar.
    pub fn for_flows(flows: usize) -> Self {
        let map = RegisterMap::default();
        if map.fits(flows) {
            return map;
        }
        let base = map.dequeue_cycle + 1;
        RegisterMap {
            weight_table: base,
            service_counter_table: base + flows,
            finish_time_table: base + 2 * flows,
            ..map
        }
    }

    /// Words of data memory needed to back every region.
    pub fn required_words(&self, flows: usize) -> usize {
        self.regions(flows)
            .iter()
            .map(|region| region.end)
            .max()
            .unwrap_or(0)
    }
}

/// Plain vector-backed data memory.
#[derive(Debug, Clone)]
pub struct DataMemory {
    words: Vec<u32>,
}

impl DataMemory {
    pub fn new(words: usize) -> Self {
        DataMemory {
            words: vec![0; words],
        }
    }

    /// Zero every word.
    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|word| *word = 0);
    }

    /// Emit `range` at debug level.
    pub fn dump(&self, range: Range<usize>) {
        let end = range.end.min(self.words.len());
        for addr in range.start..end {
            debug!("dmem[{addr:#x}] = {:#010x}", self.words[addr]);
        }
    }
}

impl MemoryInterface for DataMemory {
    fn read_word(&self, addr: usize) -> Result<u32, MemoryError> {
        self.words.get(addr).copied().ok_or(MemoryError {
            addr,
            words: self.words.len(),
        })
    }

    fn write_word(&mut self, addr: usize, value: u32) -> Result<(), MemoryError> {
        let words = self.words.len();
        let slot = self.words.get_mut(addr).ok_or(MemoryError { addr, words })?;
        *slot = value;
        trace!(addr, value, "dmem write");
        Ok(())
    }

    fn words(&self) -> usize {
        self.words.len()
    }
}

/// Write the metadata words of `packet` at `map.metadata`.
pub fn publish_metadata<M: MemoryInterface>(
    mem: &mut M,
    map: &RegisterMap,
    packet: &PacketDescriptor,
) -> Result<(), MemoryError> {
    for (offset, word) in packet.to_words().into_iter().enumerate() {
        mem.write_word(map.metadata + offset, word)?;
    }
    Ok(())
}

/// Read the metadata words at `map.metadata` back into a descriptor.
pub fn read_metadata<M: MemoryInterface>(
    mem: &M,
    map: &RegisterMap,
) -> Result<PacketDescriptor, MemoryError> {
    let mut words = [0u32; METADATA_WORDS];
    for (offset, word) in words.iter_mut().enumerate() {
        *word = mem.read_word(map.metadata + offset)?;
    }
    Ok(PacketDescriptor::from_words(&words))
}

/// Publish a computed rank and (DRR only) its virtual round id.
///
/// Data memory words are 32 bits wide, so the rank is split: low word at `result+0`, high
/// word at `result+2`. The round id, when present, is truncated to its low word at
/// `result+1`; otherwise that word keeps its previous value.
///
/// # Arguments
/// * `mem` - Data memory to write
/// * `map` - Register layout in use
/// * `rank` - Rank to publish
/// * `virtual_round_id` - DRR round id, `None` for SP and WFQ
///
/// # Returns
/// `Ok(())`, or the first [`MemoryError`] for a result slot outside `mem`
pub fn publish_rank<M: MemoryInterface>(
    mem: &mut M,
    map: &RegisterMap,
    rank: u64,
    virtual_round_id: Option<u64>,
) -> Result<(), MemoryError> {
    mem.write_word(map.result, rank as u32)?;
    if let Some(round) = virtual_round_id {
        mem.write_word(map.result + 1, round as u32)?;
    }
    mem.write_word(map.result + 2, (rank >> 32) as u32)
}

/// Reassemble the published 64-bit rank.
pub fn read_rank<M: MemoryInterface>(mem: &M, map: &RegisterMap) -> Result<u64, MemoryError> {
    let low = u64::from(mem.read_word(map.result)?);
    let high = u64::from(mem.read_word(map.result + 2)?);
    Ok((high << 32) | low)
}

/// Mirror one flow's table entries and both global scalars into memory.
pub fn mirror_flow<M: MemoryInterface>(
    mem: &mut M,
    map: &RegisterMap,
    store: &FlowStateStore,
    flow_id: u16,
) -> Result<(), MemoryError> {
    let index = usize::from(flow_id);
    if let Ok(flow) = store.get(flow_id) {
        mem.write_word(map.weight_table + index, flow.weight)?;
        mem.write_word(map.service_counter_table + index, flow.service_counter as u32)?;
        mem.write_word(map.finish_time_table + index, flow.last_finish_time as u32)?;
    }
    let global = store.global();
    mem.write_word(map.dequeue_cycle, global.dequeue_cycle as u32)?;
    mem.write_word(map.virtual_time, global.virtual_time as u32)
}

/// Mirror the whole flow table.
pub fn mirror_all<M: MemoryInterface>(
    mem: &mut M,
    map: &RegisterMap,
    store: &FlowStateStore,
) -> Result<(), MemoryError> {
    for (index, flow) in store.flows().iter().enumerate() {
        mem.write_word(map.weight_table + index, flow.weight)?;
        mem.write_word(map.service_counter_table + index, flow.service_counter as u32)?;
        mem.write_word(map.finish_time_table + index, flow.last_finish_time as u32)?;
    }
    let global = store.global();
    mem.write_word(map.dequeue_cycle, global.dequeue_cycle as u32)?;
    mem.write_word(map.virtual_time, global.virtual_time as u32)
}

/// Write to program memory. `addr` is a byte address; it is word-aligned by `>> 2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramWrite {
    pub addr: u32,
    pub data: u32,
}

/// Rank program image.
#[derive(Debug, Clone)]
pub struct ProgramMemory {
    words: Vec<u32>,
}

impl ProgramMemory {
    pub fn new(words: usize) -> Self {
        ProgramMemory {
            words: vec![0; words],
        }
    }

    /// Apply one write. Returns false, leaving memory untouched, when the address is out of range.
    pub fn apply(&mut self, write: ProgramWrite) -> bool {
        let index = (write.addr >> 2) as usize;
        match self.words.get_mut(index) {
            Some(slot) => {
                *slot = write.data;
                true
            }
            None => false,
        }
    }

    pub fn word(&self, index: usize) -> Option<u32> {
        self.words.get(index).copied()
    }

    pub fn words(&self) -> usize {
        self.words.len()
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|word| *word = 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_map_matches_legacy_addresses() {
        let map = RegisterMap::default();
        assert_eq!(map.metadata, 0x40);
        assert_eq!(map.result, 0x54);
        assert_eq!(map.weight_table, 0x60);
        assert_eq!(map.dequeue_cycle, 0x84);
        assert!(map.fits(8));
        assert_eq!(RegisterMap::for_flows(8), map);
    }

    #[test]
    fn large_flow_counts_relocate_tables() {
        let map = RegisterMap::for_flows(64);
        assert!(map.fits(64));
        assert_eq!(map.metadata, 0x40);
        assert_eq!(map.weight_table, 0x85);
        assert_eq!(map.required_words(64), 0x85 + 3 * 64);
    }

    #[test]
    fn metadata_round_trips_through_memory() {
        let map = RegisterMap::default();
        let mut mem = DataMemory::new(map.required_words(8));
        let packet = PacketDescriptor::new(3, 200)
            .with_priority(6)
            .with_endpoints(7, 9)
            .with_payload_ptr(0xDEAD_BEEF);
        publish_metadata(&mut mem, &map, &packet).unwrap();
        assert_eq!(mem.read_word(map.metadata + 2).unwrap(), 200 | (6 << 24));
        assert_eq!(read_metadata(&mem, &map).unwrap(), packet);
    }

    #[test]
    fn wide_rank_round_trips() {
        let map = RegisterMap::default();
        let mut mem = DataMemory::new(map.required_words(8));
        let rank = 0x1_0000_0101;
        publish_rank(&mut mem, &map, rank, Some(16)).unwrap();
        assert_eq!(mem.read_word(map.result).unwrap(), 0x101);
        assert_eq!(mem.read_word(map.result + 1).unwrap(), 16);
        assert_eq!(read_rank(&mem, &map).unwrap(), rank);
    }

    #[test]
    fn out_of_range_access_errors() {
        let mut mem = DataMemory::new(4);
        assert_eq!(mem.read_word(4), Err(MemoryError { addr: 4, words: 4 }));
        assert!(mem.write_word(10, 1).is_err());
    }

    #[test]
    fn program_writes_are_word_aligned() {
        let mut imem = ProgramMemory::new(4);
        assert!(imem.apply(ProgramWrite { addr: 0x8, data: 0x13 }));
        assert_eq!(imem.word(2), Some(0x13));
        assert!(!imem.apply(ProgramWrite { addr: 0x10, data: 1 }));
    }
}
