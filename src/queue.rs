//! Rank-ordered packet store.
//!
//! Entries are kept in a binary heap ordered by `(rank, sequence)`: the smallest rank is served
//! first and equal ranks are served in enqueue order. Capacity is fixed at construction; an
//! enqueue on a full store fails and leaves the store unchanged.
//!
//! [`SharedPriorityStore`] wraps the store in a mutex for callers that enqueue and dequeue from
//! different threads. Every dequeue removes the entry under the lock, so no entry is delivered
//! twice.

use crate::error::{StoreEmpty, StoreFull};
use crate::packet::PacketDescriptor;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Packet held by the store together with its rank.
#[derive(Debug, Clone)]
pub struct RankedEntry {
    pub packet: PacketDescriptor,
    pub rank: u64,
    /// Insertion counter, tie-break only.
    sequence: u64,
}

impl Ord for RankedEntry {
    /// Reversed so the max-heap yields the smallest `(rank, sequence)` first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .rank
            .cmp(&self.rank)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for RankedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RankedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.sequence == other.sequence
    }
}

impl Eq for RankedEntry {}

/// How the dequeue side selects an entry. Minimum rank is the only strategy today.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DequeueStrategy {
    #[default]
    Min,
}

/// Enqueue message: metadata plus its computed rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub metadata: PacketDescriptor,
    pub rank: u64,
}

/// Dequeue message issued once per tick by the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DequeueRequest {
    pub strategy: DequeueStrategy,
}

/// Answer to a [`DequeueRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueResponse {
    Packet { metadata: PacketDescriptor, rank: u64 },
    Empty,
}

/// Bounded min-rank store.
#[derive(Debug)]
pub struct PriorityStore {
    heap: BinaryHeap<RankedEntry>,
    capacity: usize,
    next_sequence: u64,
}

impl PriorityStore {
    pub fn new(capacity: usize) -> Self {
        PriorityStore {
            heap: BinaryHeap::with_capacity(capacity),
            capacity,
            next_sequence: 0,
        }
    }

    /// Insert `packet` with `rank`.
    ///
    /// The entry gets the next sequence number, so among equal ranks it is served after
    /// everything already stored.
    ///
    /// # Arguments
    /// * `packet` - Packet metadata to store
    /// * `rank` - Rank computed for the packet; smaller ranks dequeue first
    ///
    /// # Returns
    /// `Ok(())` on insert, or [`StoreFull`] at capacity with the store left unchanged
    pub fn enqueue(&mut self, packet: PacketDescriptor, rank: u64) -> Result<(), StoreFull> {
        if self.heap.len() >= self.capacity {
            return Err(StoreFull {
                capacity: self.capacity,
            });
        }
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.heap.push(RankedEntry {
            packet,
            rank,
            sequence,
        });
        Ok(())
    }

    /// Remove the smallest-rank entry (earliest enqueued among equal ranks).
    pub fn dequeue_min(&mut self) -> Result<PacketDescriptor, StoreEmpty> {
        self.dequeue_min_entry().map(|entry| entry.packet)
    }

    /// Like [`dequeue_min`](Self::dequeue_min) but keeps the rank.
    pub fn dequeue_min_entry(&mut self) -> Result<RankedEntry, StoreEmpty> {
        self.heap.pop().ok_or(StoreEmpty)
    }

    pub fn peek_min_rank(&self) -> Option<u64> {
        self.heap.peek().map(|entry| entry.rank)
    }

    /// Serve one channel-protocol enqueue.
    pub fn handle_enqueue(&mut self, request: EnqueueRequest) -> Result<(), StoreFull> {
        self.enqueue(request.metadata, request.rank)
    }

    /// Serve one channel-protocol dequeue.
    pub fn handle_dequeue(&mut self, request: DequeueRequest) -> DequeueResponse {
        match request.strategy {
            DequeueStrategy::Min => match self.dequeue_min_entry() {
                Ok(entry) => DequeueResponse::Packet {
                    metadata: entry.packet,
                    rank: entry.rank,
                },
                Err(StoreEmpty) => DequeueResponse::Empty,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every entry. The sequence counter keeps running.
    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

/// [`PriorityStore`] behind a mutex, serialising enqueue against dequeue.
#[derive(Debug)]
pub struct SharedPriorityStore {
    inner: Mutex<PriorityStore>,
}

impl SharedPriorityStore {
    pub fn new(capacity: usize) -> Self {
        SharedPriorityStore {
            inner: Mutex::new(PriorityStore::new(capacity)),
        }
    }

    pub fn enqueue(&self, packet: PacketDescriptor, rank: u64) -> Result<(), StoreFull> {
        self.inner.lock().enqueue(packet, rank)
    }

    pub fn dequeue_min(&self) -> Result<PacketDescriptor, StoreEmpty> {
        self.inner.lock().dequeue_min()
    }

    pub fn handle_enqueue(&self, request: EnqueueRequest) -> Result<(), StoreFull> {
        self.inner.lock().handle_enqueue(request)
    }

    pub fn handle_dequeue(&self, request: DequeueRequest) -> DequeueResponse {
        self.inner.lock().handle_dequeue(request)
    }

    pub fn peek_min_rank(&self) -> Option<u64> {
        self.inner.lock().peek_min_rank()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear()
    }
}
