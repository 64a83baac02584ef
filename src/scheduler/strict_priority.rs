//! Strict priority: the rank is the packet's 3-bit priority field, read from metadata word 2.
//! Stateless.

use crate::packet::{extract_bits, PacketDescriptor, PRIORITY_BITS, PRIORITY_SHIFT};

/// Rank of `packet` under strict priority (0..=7).
pub fn rank(packet: &PacketDescriptor) -> u64 {
    let word2 = packet.to_words()[2];
    u64::from(extract_bits(word2, PRIORITY_SHIFT, PRIORITY_BITS))
}
