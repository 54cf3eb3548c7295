// Message Codec Port
// Body encoding is opaque to the broker: it only needs bytes in and out

use crate::domain::Message;
use thiserror::Error;

/// Content type announced by the default codec
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to decode message: {0}")]
pub struct DecodeError(pub String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to encode message: {0}")]
pub struct EncodeError(pub String);

/// Message body codec
pub trait MessageCodec: Send + Sync {
    fn content_type(&self) -> &str;

    fn encode(&self, message: &Message) -> Result<Vec<u8>, EncodeError>;

    fn decode(&self, body: &[u8]) -> Result<Message, DecodeError>;
}

/// JSON envelope codec (production default)
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(message).map_err(|e| EncodeError(e.to_string()))
    }

    fn decode(&self, body: &[u8]) -> Result<Message, DecodeError> {
        serde_json::from_slice(body).map_err(|e| DecodeError(e.to_string()))
    }
}
