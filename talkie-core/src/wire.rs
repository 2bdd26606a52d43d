//! Message codec: compact single-line JSON, one object per frame.

use crate::message::Message;

/// Largest encoded message accepted on either side (one UDP receive buffer).
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Encode a message with no whitespace between tokens, fields in insertion order.
pub fn encode(message: &Message) -> Result<Vec<u8>, EncodeError> {
    let bytes = serde_json::to_vec(message).map_err(EncodeError::Encode)?;
    if bytes.len() > MAX_MESSAGE_LEN {
        return Err(EncodeError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}

/// Error encoding a message (serializer failure or size limit).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("message too large ({0} bytes)")]
    TooLarge(usize),
}

/// Decode one frame. Anything other than a flat JSON object fails.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    if bytes.len() > MAX_MESSAGE_LEN {
        return Err(DecodeError::TooLarge(bytes.len()));
    }
    let text = std::str::from_utf8(bytes)?;
    Ok(serde_json::from_str(text)?)
}

/// Error decoding a frame. Always recoverable: the frame is dropped.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is not utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("frame too large ({0} bytes)")]
    TooLarge(usize),
}
