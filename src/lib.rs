pub mod config;
pub mod discipline;
pub mod error;
pub mod flow_state;
pub mod memory;
pub mod metrics;
pub mod node;
pub mod packet;
pub mod queue;
pub mod scheduler;

// Re-export for easier testing
pub use config::NodeConfig;
pub use discipline::Discipline;
pub use error::SchedError;
pub use node::{InboundPacket, NodeController, NodePorts, NodeState, Reconfigure, ResetKind};
pub use packet::PacketDescriptor;
pub use queue::PriorityStore;
pub use scheduler::{OverflowPolicy, RankEngine};
