//! Codec seam between opaque transport payloads and domain records.
//!
//! The transport core never interprets payload bytes itself; the owning
//! process injects an encoder/decoder pair and the controllers call it at
//! the pipeline boundary. A serde_json-backed implementation is provided
//! for record types that derive `Serialize`/`Deserialize`.

use crate::error::{Result, TransportError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;

/// Decodes opaque payload bytes into a domain record.
pub trait RecordDecoder: Send + Sync {
    /// The domain record type produced
    type Record: Send;

    /// Decode a payload; failures are per-message and must not carry state
    /// across calls.
    fn decode(&self, payload: &[u8]) -> Result<Self::Record>;
}

/// Encodes a domain record into opaque payload bytes.
pub trait RecordEncoder: Send + Sync {
    /// The domain record type consumed
    type Record: Send;

    /// Encode a record into the bytes published to the broker.
    fn encode(&self, record: &Self::Record) -> Result<Vec<u8>>;
}

/// JSON codec for any serde-enabled record type.
#[derive(Debug)]
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    /// Create a new JSON codec.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RecordDecoder for JsonCodec<T>
where
    T: DeserializeOwned + Send,
{
    type Record = T;

    fn decode(&self, payload: &[u8]) -> Result<T> {
        serde_json::from_slice(payload).map_err(|e| TransportError::codec(e.to_string()))
    }
}

impl<T> RecordEncoder for JsonCodec<T>
where
    T: Serialize + Send,
{
    type Record = T;

    fn encode(&self, record: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(record).map_err(|e| TransportError::codec(e.to_string()))
    }
}
