//! Pluggable payload serialization.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Errors produced by a [`Serializer`].
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    /// JSON encoding or decoding failed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Postcard encoding or decoding failed.
    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Converts values to and from bytes.
pub trait Serializer: Send + Sync + 'static {
    /// Encode a value.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, SerializeError>;

    /// Decode a value of type `T`.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializeError>;
}

/// JSON via `serde_json`. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, SerializeError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Compact binary encoding via `postcard`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardSerializer;

impl Serializer for PostcardSerializer {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, SerializeError> {
        Ok(postcard::to_allocvec(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializeError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}
