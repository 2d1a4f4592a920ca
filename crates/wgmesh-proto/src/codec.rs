//! Codec for encoding/decoding control messages

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Incomplete message")]
    IncompleteMessage,
}

/// Control message codec
///
/// Format: `[length: u32 big-endian][payload: bincode]`. Control frames
/// are small; the cap exists so a corrupt length prefix cannot make a
/// reader allocate unbounded memory.
pub struct ControlCodec;

impl ControlCodec {
    /// Maximum frame size (1 MiB)
    pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

    /// Encode a message to a length-prefixed frame
    pub fn encode<M: Serialize>(msg: &M) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode one message out of an accumulation buffer
    ///
    /// Returns Ok(Some(message)) when a complete frame was consumed,
    /// Ok(None) when more bytes are needed, Err on a malformed frame.
    pub fn decode<M: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<M>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let msg_bytes = buf.split_to(length);

        let msg: M = bincode::deserialize(&msg_bytes)?;

        Ok(Some(msg))
    }
}
