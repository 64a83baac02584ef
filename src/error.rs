//! Error taxonomy shared by the rank engine, the priority store and the node controller.
//!
//! Configuration problems are fatal for the affected packet only: the packet is rejected and
//! no scheduling state is mutated. Store capacity and emptiness are ordinary outcomes that the
//! controller absorbs locally (drop counter, idle tick).

use thiserror::Error;

/// Invalid flow configuration detected before a rank computation runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("flow {flow_id} outside configured range 0..{flows}")]
    UnknownFlow { flow_id: u16, flows: usize },

    #[error("flow {flow_id} has weight 0 (inactive)")]
    InactiveFlow { flow_id: u16 },

    #[error("flow {flow_id} quantum {quantum} below minimum packet size {min_packet_size}")]
    QuantumBelowFloor {
        flow_id: u16,
        quantum: u32,
        min_packet_size: u32,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Input rejected at the ingestion boundary; never reaches the rank engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MalformedInput {
    #[error("zero-length packet")]
    ZeroLength,

    #[error("packet length {length} below minimum {min}")]
    BelowMinimum { length: u16, min: u32 },

    #[error("unknown discipline tag {0}")]
    UnknownDiscipline(u8),
}

/// Which scheduling counter overflowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    ServiceCounter,
    DequeueCycle,
    FinishTime,
    Rank,
}

impl std::fmt::Display for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Counter::ServiceCounter => "service_counter",
            Counter::DequeueCycle => "dequeue_cycle",
            Counter::FinishTime => "finish_time",
            Counter::Rank => "rank",
        };
        write!(f, "{label}")
    }
}

/// Priority store rejected an enqueue because it is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("priority store full (capacity {capacity})")]
pub struct StoreFull {
    pub capacity: usize,
}

/// Priority store had nothing to dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("priority store empty")]
pub struct StoreEmpty;

/// Top-level scheduler error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("malformed input: {0}")]
    MalformedInput(#[from] MalformedInput),

    #[error("priority store full (capacity {capacity})")]
    Full { capacity: usize },

    #[error("priority store empty")]
    Empty,

    #[error("{counter} overflow on flow {flow_id}")]
    CounterOverflow { counter: Counter, flow_id: u16 },
}

impl From<StoreFull> for SchedError {
    fn from(err: StoreFull) -> Self {
        SchedError::Full {
            capacity: err.capacity,
        }
    }
}

impl From<StoreEmpty> for SchedError {
    fn from(_: StoreEmpty) -> Self {
        SchedError::Empty
    }
}

pub type Result<T, E = SchedError> = std::result::Result<T, E>;
