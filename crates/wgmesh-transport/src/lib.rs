//! QUIC transport for the wgmesh control plane
//!
//! One QUIC connection per peer; the first bidirectional stream carries
//! the persistent control conversation, further streams carry unary
//! RPCs. TLS 1.3 is mandatory; development and test deployments use
//! self-signed certificates from `wgmesh-cert` with verification
//! disabled on the client.

pub mod config;
pub mod connection;
pub mod listener;
pub mod stream;

pub use config::QuicConfig;
pub use connection::ControlConnection;
pub use listener::{QuicConnector, QuicListener};
pub use stream::{ControlRecvHalf, ControlSendHalf, ControlStream};

use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Endpoint closed")]
    EndpointClosed,
}

pub type TransportResult<T> = Result<T, TransportError>;
