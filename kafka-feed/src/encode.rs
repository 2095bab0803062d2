//! Key/value encoders applied by the producer before records reach the client.

use crate::error::EncodeError;
use crate::message::Payload;

pub trait Encoder: Send + Sync {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, EncodeError>;
}

/// Accepts anything: text becomes UTF-8, bytes pass through untouched and
/// JSON is serialized compactly.
#[derive(Clone, Copy, Debug, Default)]
pub struct SafeEncoder;

impl Encoder for SafeEncoder {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, EncodeError> {
        match payload {
            Payload::Text(text) => Ok(text.as_bytes().to_vec()),
            Payload::Binary(bytes) => Ok(bytes.clone()),
            Payload::Json(value) => Ok(serde_json::to_vec(value)?),
        }
    }
}

/// Like [`SafeEncoder`], but refuses binary payloads that are not valid UTF-8,
/// for topics whose readers expect text.
#[derive(Clone, Copy, Debug, Default)]
pub struct Utf8Encoder;

impl Encoder for Utf8Encoder {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, EncodeError> {
        match payload {
            Payload::Binary(bytes) => Ok(String::from_utf8(bytes.clone())?.into_bytes()),
            other => SafeEncoder.encode(other),
        }
    }
}
