use serde::Serialize;

use super::messages::{ClientMessage, ServerMessage};

/// Maximum size of an inbound client frame in bytes. Server frames carry
/// room snapshots and are not capped.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug)]
pub enum ProtocolError {
    EmptyMessage,
    PayloadTooLarge(usize),
    SerializeError(String),
    DeserializeError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::PayloadTooLarge(size) => {
                write!(
                    f,
                    "payload too large: {size} bytes (max {MAX_MESSAGE_SIZE})"
                )
            },
            Self::SerializeError(e) => write!(f, "serialize error: {e}"),
            Self::DeserializeError(e) => write!(f, "deserialize error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Encode any serializable message as a JSON text frame.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(|e| ProtocolError::SerializeError(e.to_string()))
}

/// Encode a `ClientMessage` to wire format.
pub fn encode_client_message(msg: &ClientMessage) -> Result<String, ProtocolError> {
    encode_message(msg)
}

/// Encode a `ServerMessage` to wire format.
pub fn encode_server_message(msg: &ServerMessage) -> Result<String, ProtocolError> {
    encode_message(msg)
}

fn check_frame(data: &[u8], max_len: Option<usize>) -> Result<(), ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    if max_len.is_some_and(|max| data.len() > max) {
        return Err(ProtocolError::PayloadTooLarge(data.len()));
    }
    Ok(())
}

/// Decode raw frame bytes into a `ClientMessage`.
pub fn decode_client_message(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
    check_frame(data, Some(MAX_MESSAGE_SIZE))?;
    serde_json::from_slice(data).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
}

/// Decode raw frame bytes into a `ServerMessage`.
pub fn decode_server_message(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
    check_frame(data, None)?;
    serde_json::from_slice(data).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
}
