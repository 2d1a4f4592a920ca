//! QUIC connection wrapper

use crate::stream::ControlStream;
use crate::{TransportError, TransportResult};
use quinn::{Connection, VarInt};
use std::net::SocketAddr;
use tracing::{debug, trace};

/// One QUIC connection to a remote node
#[derive(Debug)]
pub struct ControlConnection {
    connection: Connection,
}

impl ControlConnection {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// Open a new bidirectional stream
    pub async fn open_stream(&self) -> TransportResult<ControlStream> {
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        trace!("Opened bidirectional stream {}", send.id().index());
        Ok(ControlStream::new(send, recv))
    }

    /// Accept an incoming bidirectional stream
    pub async fn accept_stream(&self) -> TransportResult<ControlStream> {
        let (send, recv) = self
            .connection
            .accept_bi()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        trace!("Accepted bidirectional stream {}", send.id().index());
        Ok(ControlStream::new(send, recv))
    }

    /// Close the connection
    pub fn close(&self, error_code: u32, reason: &[u8]) {
        self.connection.close(VarInt::from_u32(error_code), reason);
        debug!("QUIC connection closed");
    }

    /// Whether the connection has been closed (either side)
    pub fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    /// Wait until the connection is closed
    pub async fn closed(&self) {
        self.connection.closed().await;
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    pub fn stable_id(&self) -> usize {
        self.connection.stable_id()
    }
}
