//! wgmesh regional coordinator
//!
//! Terminates persistent peer control streams, tracks sessions, answers
//! inter-coordinator exit-allocation RPCs, and arranges tunnels between
//! client peers and exit peers — directly when reachability permits,
//! spliced through the coordinator's own relay interface otherwise.

mod node;
mod orchestrator;
mod pending;
mod relay;
mod session;
mod stream_manager;

pub use node::{Coordinator, CoordinatorConfig, RelaySettings};
pub use orchestrator::{ExitAllocation, ExitOrchestrator};
pub use pending::PendingCommands;
pub use relay::{RelayLease, RelayProvisioner};
pub use session::{Session, SessionStats};
pub use stream_manager::{StreamManager, StreamManagerConfig, StreamMetrics};
