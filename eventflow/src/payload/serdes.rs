//! Payload marshaling for stream messages.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::{Payload, TypeRegistry};
use crate::compression::Compression;
use crate::errors::{EngineError, EngineResult};

/// Serialization format of payload bytes. The string form is the `ser` wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Serialization {
    /// Plain JSON text.
    #[default]
    Json,
    /// JSON text wrapped in standard base64.
    JsonBase64,
    /// MessagePack with named fields.
    Msgpack,
}

impl Serialization {
    fn serialize(self, value: &Value) -> EngineResult<Vec<u8>> {
        match self {
            Self::Json => Ok(serde_json::to_vec(value)?),
            Self::JsonBase64 => Ok(BASE64.encode(serde_json::to_vec(value)?).into_bytes()),
            Self::Msgpack => rmp_serde::to_vec_named(value)
                .map_err(|e| EngineError::Serialization(e.to_string())),
        }
    }

    fn deserialize(self, bytes: &[u8]) -> EngineResult<Value> {
        match self {
            Self::Json => Ok(serde_json::from_slice(bytes)?),
            Self::JsonBase64 => {
                let raw = BASE64
                    .decode(bytes)
                    .map_err(|e| EngineError::Serialization(e.to_string()))?;
                Ok(serde_json::from_slice(&raw)?)
            }
            Self::Msgpack => rmp_serde::from_slice(bytes)
                .map_err(|e| EngineError::Serialization(e.to_string())),
        }
    }
}

impl fmt::Display for Serialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::JsonBase64 => "json+base64",
            Self::Msgpack => "msgpack",
        })
    }
}

impl FromStr for Serialization {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "json+base64" | "json_base64" => Ok(Self::JsonBase64),
            "msgpack" => Ok(Self::Msgpack),
            _ => Err(EngineError::Serialization(format!("unknown serialization '{s}'"))),
        }
    }
}

impl TryFrom<String> for Serialization {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Serialization> for String {
    fn from(value: Serialization) -> Self {
        value.to_string()
    }
}

/// Serializes then compresses a payload value.
pub fn encode_payload(
    payload: &Payload,
    serialization: Serialization,
    compression: Compression,
) -> EngineResult<Vec<u8>> {
    let bytes = serialization.serialize(payload.value())?;
    compression
        .compress(&bytes)
        .map_err(|e| EngineError::Serialization(e.to_string()))
}

/// Decompresses and deserializes bytes into a payload of `datatype`.
///
/// Unknown datatypes are decode errors; malformed bytes are serialization errors.
pub fn decode_payload(
    bytes: &[u8],
    serialization: Serialization,
    compression: Compression,
    datatype: &str,
    registry: &TypeRegistry,
) -> EngineResult<Payload> {
    if !registry.contains(datatype) {
        return Err(EngineError::decode(format!("unknown datatype '{datatype}'")));
    }
    let raw = compression
        .decompress(bytes)
        .map_err(|e| EngineError::Serialization(e.to_string()))?;
    let value = serialization.deserialize(&raw)?;
    registry.payload(datatype, value)
}
