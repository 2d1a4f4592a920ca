//! wgmesh peer
//!
//! A peer keeps one persistent authenticated stream to its regional
//! coordinator, answers commands pushed down that stream, and drives its
//! own data plane: a client tunnel interface when consuming exits, an
//! exit interface with a client table when providing them. Roles are
//! runtime-changeable; the role controller serializes transitions.

mod backoff;
mod client;
mod client_tunnel;
mod exit_service;
mod replay;
mod role;

pub use backoff::{BackoffConfig, ReconnectBackoff};
pub use client::{CommandHandler, ExitGrant, PeerClient, PeerClientConfig};
pub use client_tunnel::{ActiveExit, ClientDisconnectHandler, ClientTunnel};
pub use exit_service::{
    DisconnectHandler, ExitClient, ExitService, ExitServiceConfig, RotatePeerHandler,
    SetupExitHandler,
};
pub use replay::ReplayCache;
pub use role::RoleController;
