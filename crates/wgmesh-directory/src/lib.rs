//! Coordinator directory
//!
//! A flat registry of coordinators keyed by identifier. Coordinators
//! re-register every heartbeat interval; queries answer region-scoped,
//! freshness-filtered candidate lists ordered by load. The directory is
//! a soft cache: an entry that stops heartbeating ages out, nothing is
//! ever retracted synchronously.

mod client;
mod registry;
mod server;

pub use client::DirectoryClient;
pub use registry::{DirectoryConfig, DirectoryRegistry};
pub use server::DirectoryServer;
