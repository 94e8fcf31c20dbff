//! Wire serialization: MessagePack or JSON, selected at connect time.
//!
//! Encoding always uses the configured [`SerializationFormat`]. Decoding is
//! self-describing: every envelope is a map, so a payload whose first
//! non-whitespace byte is `{` or `[` is JSON; anything else is decoded as
//! MessagePack first with a JSON fallback.

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

// Layer 3: Internal module imports
use crate::error::{AegisError, Result};

/// Wire format for all message envelopes and KV values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    /// Compact binary MessagePack (default).
    #[default]
    #[serde(rename = "msgpack")]
    MessagePack,
    /// Human-readable JSON.
    Json,
}

impl SerializationFormat {
    /// Parse the `serialization` config value (`msgpack` or `json`).
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "msgpack" => Ok(Self::MessagePack),
            "json" => Ok(Self::Json),
            other => Err(AegisError::Config {
                reason: format!("unknown serialization format {other:?} (expected msgpack|json)"),
            }),
        }
    }
}

/// Encode a value in the given wire format.
pub fn encode<T: Serialize>(value: &T, format: SerializationFormat) -> Result<Bytes> {
    let bytes = match format {
        SerializationFormat::MessagePack => rmp_serde::to_vec_named(value)
            .map_err(|e| AegisError::serialization(format!("msgpack encode: {e}")))?,
        SerializationFormat::Json => serde_json::to_vec(value)
            .map_err(|e| AegisError::serialization(format!("json encode: {e}")))?,
    };
    Ok(Bytes::from(bytes))
}

/// Decode a payload, auto-detecting the wire format.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let first = bytes.iter().find(|b| !b.is_ascii_whitespace()).copied();
    match first {
        None => Err(AegisError::serialization("empty payload")),
        Some(b'{') | Some(b'[') => serde_json::from_slice(bytes)
            .map_err(|e| AegisError::serialization(format!("json decode: {e}"))),
        Some(_) => rmp_serde::from_slice(bytes).or_else(|mp_err| {
            serde_json::from_slice(bytes).map_err(|_| {
                AegisError::serialization(format!("msgpack decode: {mp_err}"))
            })
        }),
    }
}
