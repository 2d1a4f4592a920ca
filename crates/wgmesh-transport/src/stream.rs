//! Framed message stream over one QUIC bidirectional stream

use crate::{TransportError, TransportResult};
use bytes::BytesMut;
use quinn::{RecvStream, SendStream};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;
use wgmesh_proto::ControlCodec;

/// A bidirectional stream carrying length-prefixed control frames.
///
/// `recv_message` accumulates chunks into a buffer and decodes complete
/// frames out of it, so the stream can stay open for the lifetime of a
/// session rather than one message per stream.
pub struct ControlStream {
    send: SendStream,
    recv: RecvStream,
    stream_id: u64,
    closed: bool,
    recv_buffer: BytesMut,
}

impl ControlStream {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        let stream_id = send.id().index();
        Self {
            send,
            recv,
            stream_id,
            closed: false,
            recv_buffer: BytesMut::with_capacity(8192),
        }
    }

    pub fn id(&self) -> u64 {
        self.stream_id
    }

    /// Encode and send one frame
    pub async fn send_message<M: Serialize>(&mut self, message: &M) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::StreamClosed);
        }

        let encoded = ControlCodec::encode(message)
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

        self.send
            .write_all(&encoded)
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        trace!("Sent frame on stream {}", self.stream_id);
        Ok(())
    }

    /// Receive the next frame, or None when the peer finished the stream
    pub async fn recv_message<M: DeserializeOwned>(&mut self) -> TransportResult<Option<M>> {
        if self.closed && self.recv_buffer.is_empty() {
            return Ok(None);
        }

        loop {
            match ControlCodec::decode::<M>(&mut self.recv_buffer)
                .map_err(|e| TransportError::ProtocolError(e.to_string()))?
            {
                Some(msg) => {
                    trace!("Received frame on stream {}", self.stream_id);
                    return Ok(Some(msg));
                }
                None => {
                    if self.closed {
                        // Peer finished mid-frame
                        return Err(TransportError::ProtocolError(
                            "Incomplete frame at stream end".to_string(),
                        ));
                    }
                    match self.recv.read_chunk(8192, true).await {
                        Ok(Some(chunk)) => {
                            self.recv_buffer.extend_from_slice(&chunk.bytes);
                        }
                        Ok(None) => {
                            self.closed = true;
                            if self.recv_buffer.is_empty() {
                                return Ok(None);
                            }
                        }
                        Err(e) => {
                            self.closed = true;
                            return Err(TransportError::ConnectionError(e.to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Finish the send side gracefully
    pub async fn finish(&mut self) -> TransportResult<()> {
        self.send
            .finish()
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
        Ok(())
    }

    /// Split into send and receive halves for concurrent reader/writer
    /// tasks without a shared mutex.
    pub fn split(self) -> (ControlSendHalf, ControlRecvHalf) {
        let send_half = ControlSendHalf {
            send: self.send,
            stream_id: self.stream_id,
        };
        let recv_half = ControlRecvHalf {
            recv: self.recv,
            stream_id: self.stream_id,
            closed: self.closed,
            recv_buffer: self.recv_buffer,
        };
        (send_half, recv_half)
    }
}

/// Write half of a split [`ControlStream`]
pub struct ControlSendHalf {
    send: SendStream,
    stream_id: u64,
}

impl ControlSendHalf {
    pub async fn send_message<M: Serialize>(&mut self, message: &M) -> TransportResult<()> {
        let encoded = ControlCodec::encode(message)
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

        self.send
            .write_all(&encoded)
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        trace!("Sent frame on stream {}", self.stream_id);
        Ok(())
    }

    pub async fn finish(&mut self) -> TransportResult<()> {
        self.send
            .finish()
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
        Ok(())
    }
}

/// Read half of a split [`ControlStream`]
pub struct ControlRecvHalf {
    recv: RecvStream,
    stream_id: u64,
    closed: bool,
    recv_buffer: BytesMut,
}

impl ControlRecvHalf {
    pub async fn recv_message<M: DeserializeOwned>(&mut self) -> TransportResult<Option<M>> {
        if self.closed && self.recv_buffer.is_empty() {
            return Ok(None);
        }

        loop {
            match ControlCodec::decode::<M>(&mut self.recv_buffer)
                .map_err(|e| TransportError::ProtocolError(e.to_string()))?
            {
                Some(msg) => {
                    trace!("Received frame on stream {}", self.stream_id);
                    return Ok(Some(msg));
                }
                None => {
                    if self.closed {
                        return Err(TransportError::ProtocolError(
                            "Incomplete frame at stream end".to_string(),
                        ));
                    }
                    match self.recv.read_chunk(8192, true).await {
                        Ok(Some(chunk)) => {
                            self.recv_buffer.extend_from_slice(&chunk.bytes);
                        }
                        Ok(None) => {
                            self.closed = true;
                            if self.recv_buffer.is_empty() {
                                return Ok(None);
                            }
                        }
                        Err(e) => {
                            self.closed = true;
                            return Err(TransportError::ConnectionError(e.to_string()));
                        }
                    }
                }
            }
        }
    }
}
