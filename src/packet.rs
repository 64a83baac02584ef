//! Packet descriptor shared by every stage of the node.
//!
//! The descriptor is metadata only: the payload lives elsewhere and is referenced through
//! `payload_ptr`. When a descriptor is handed to the rank engine it travels as five 32-bit
//! metadata words whose layout must stay bit-exact for existing rank programs:
//!
//! | word | contents |
//! |------|----------|
//! | 0 | `src` |
//! | 1 | `dst` |
//! | 2 | `length` (bits 0-15) \| `tos` (bits 16-23) \| `priority` (bits 24-26) |
//! | 3 | `flow_id` (bits 0-15) \| `arrival_time` (bits 16-31) |
//! | 4 | `payload_ptr` |

use crate::error::MalformedInput;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of 32-bit words occupied by a descriptor in data memory.
pub const METADATA_WORDS: usize = 5;

/// Bit offset of the 3-bit priority field inside metadata word 2.
pub const PRIORITY_SHIFT: u32 = 24;
/// Width of the priority field.
pub const PRIORITY_BITS: u32 = 3;
/// Bit offset of the type-of-service byte inside metadata word 2.
pub const TOS_SHIFT: u32 = 16;
/// Bit offset of the arrival time inside metadata word 3.
pub const ARRIVAL_SHIFT: u32 = 16;

/// Extract `width` bits of `word` starting at `offset`.
#[inline]
pub const fn extract_bits(word: u32, offset: u32, width: u32) -> u32 {
    if width >= 32 {
        word >> offset
    } else {
        (word >> offset) & ((1u32 << width) - 1)
    }
}

/// Immutable per-packet metadata as produced by the ingestion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketDescriptor {
    pub src: u32,
    pub dst: u32,
    /// Length in bytes.
    pub length: u16,
    pub tos: u8,
    /// 0 = low .. 7 = high. Only the low three bits are meaningful.
    pub priority: u8,
    pub flow_id: u16,
    pub arrival_time: u16,
    /// Opaque reference to payload storage owned elsewhere.
    pub payload_ptr: u32,
}

impl PacketDescriptor {
    /// Create a descriptor for `flow_id` with the given length; remaining fields are zero.
    pub fn new(flow_id: u16, length: u16) -> Self {
        PacketDescriptor {
            src: 0,
            dst: 0,
            length,
            tos: 0,
            priority: 0,
            flow_id,
            arrival_time: 0,
            payload_ptr: 0,
        }
    }

    pub fn with_endpoints(mut self, src: u32, dst: u32) -> Self {
        self.src = src;
        self.dst = dst;
        self
    }

    /// Set the priority, keeping only its low three bits.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority & 0x7;
        self
    }

    pub fn with_tos(mut self, tos: u8) -> Self {
        self.tos = tos;
        self
    }

    pub fn with_arrival_time(mut self, arrival_time: u16) -> Self {
        self.arrival_time = arrival_time;
        self
    }

    pub fn with_payload_ptr(mut self, payload_ptr: u32) -> Self {
        self.payload_ptr = payload_ptr;
        self
    }

    /// Encode into the five metadata words.
    pub fn to_words(&self) -> [u32; METADATA_WORDS] {
        [
            self.src,
            self.dst,
            u32::from(self.length)
                | (u32::from(self.tos) << TOS_SHIFT)
                | ((u32::from(self.priority) & 0x7) << PRIORITY_SHIFT),
            u32::from(self.flow_id) | (u32::from(self.arrival_time) << ARRIVAL_SHIFT),
            self.payload_ptr,
        ]
    }

    /// Decode from the five metadata words. Bits outside the defined fields are ignored.
    pub fn from_words(words: &[u32; METADATA_WORDS]) -> Self {
        PacketDescriptor {
            src: words[0],
            dst: words[1],
            length: extract_bits(words[2], 0, 16) as u16,
            tos: extract_bits(words[2], TOS_SHIFT, 8) as u8,
            priority: extract_bits(words[2], PRIORITY_SHIFT, PRIORITY_BITS) as u8,
            flow_id: extract_bits(words[3], 0, 16) as u16,
            arrival_time: extract_bits(words[3], ARRIVAL_SHIFT, 16) as u16,
            payload_ptr: words[4],
        }
    }

    /// Ingestion-boundary checks. Zero length is always malformed; `min_length`, when given,
    /// rejects runts below the floor.
    pub fn validate(&self, min_length: Option<u32>) -> Result<(), MalformedInput> {
        if self.length == 0 {
            return Err(MalformedInput::ZeroLength);
        }
        if let Some(min) = min_length {
            if u32::from(self.length) < min {
                return Err(MalformedInput::BelowMinimum {
                    length: self.length,
                    min,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for PacketDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(src={}, dst={}, length={}, tos={}, priority={}, flow_id={}, arrival_time={}, payload_ptr={:#x})",
            self.src,
            self.dst,
            self.length,
            self.tos,
            self.priority,
            self.flow_id,
            self.arrival_time,
            self.payload_ptr
        )
    }
}
