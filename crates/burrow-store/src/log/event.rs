//! Log record types and framing

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::LENGTH_PREFIX;
use crate::error::{StoreError, StoreResult};
use crate::key::Key;
use crate::registry::TypeTag;

/// A single record in the storage log
///
/// Serialized as a JSON object with a `"kind"` discriminant; `Set` data is
/// base64 text so the log stays readable without any schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEvent {
    /// A writer opened the log. Diagnostic only; never replayed into the cache
    Session {
        /// Random identifier of the session
        id: Uuid,
        /// Wall-clock time the session started
        timestamp_millis: i64,
    },
    /// A value was stored under a key
    Set {
        /// Tag selecting the decoder on replay
        tag: TypeTag,
        /// Canonical key
        key: Key,
        /// Encoded value
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    /// A key was removed
    Delete {
        /// Tag of the value that was removed
        tag: TypeTag,
        /// Canonical key
        key: Key,
    },
}

impl LogEvent {
    /// A fresh session marker stamped with the current time
    pub fn session() -> Self {
        Self::Session {
            id: Uuid::new_v4(),
            timestamp_millis: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Key the event applies to, if any
    pub fn key(&self) -> Option<&Key> {
        match self {
            Self::Session { .. } => None,
            Self::Set { key, .. } | Self::Delete { key, .. } => Some(key),
        }
    }

    /// Short name of the event kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Session { .. } => "session",
            Self::Set { .. } => "set",
            Self::Delete { .. } => "delete",
        }
    }

    /// Serialize into a complete frame: length prefix followed by payload
    pub fn to_frame(&self) -> StoreResult<Vec<u8>> {
        let payload =
            serde_json::to_vec(self).map_err(|e| StoreError::serialization(e.to_string()))?;
        let mut frame = Vec::with_capacity(LENGTH_PREFIX + payload.len());
        frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Parse a frame payload (without its length prefix)
    pub fn from_payload(payload: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(payload).map_err(|e| StoreError::deserialization(e.to_string()))
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
