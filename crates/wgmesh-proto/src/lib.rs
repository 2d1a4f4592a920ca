//! Wire protocol for the wgmesh control plane
//!
//! Every conversation in the system rides a single tagged message enum:
//! the persistent peer/coordinator control stream, the unary
//! inter-coordinator exit-allocation RPC, and the directory RPCs. Frames
//! are length-prefixed bincode (see [`codec`]).

pub mod codec;
pub mod error;
pub mod messages;

pub use codec::{CodecError, ControlCodec};
pub use error::ControlError;
pub use messages::{
    Command, CommandKind, CommandResponse, ControlMessage, ControlPayload, CoordinatorInfo,
    ExitPeerInfo, PeerRole,
};
