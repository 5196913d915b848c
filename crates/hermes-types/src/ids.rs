//! Identifiers used throughout Hermes.
//!
//! Sessions use UUIDv7 for time-ordered sorting. Gateways are identified
//! by their raw ed25519 public key, hex-encoded on the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::{GatewayError, Result};

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Unique identifier of one transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Extract the embedded creation timestamp (milliseconds since UNIX epoch).
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        let bytes = self.0.as_bytes();
        u64::from_be_bytes([
            0, 0, bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5],
        ])
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| GatewayError::Serialization(format!("bad session id {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// GatewayId
// ---------------------------------------------------------------------------

/// A gateway's identity: its raw ed25519 public key (32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct GatewayId(pub [u8; 32]);

impl GatewayId {
    #[must_use]
    pub fn from_pubkey(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| GatewayError::Serialization(format!("bad gateway key: {e}")))?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            GatewayError::Serialization(format!("gateway key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(key))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gw:{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GatewayId({})", self.short())
    }
}

impl Serialize for GatewayId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for GatewayId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_time_ordered() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert!(a <= b);
        assert!(a.timestamp_ms() > 0);
    }

    #[test]
    fn session_id_parses_its_display() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }

    #[test]
    fn gateway_id_serializes_as_hex() {
        let id = GatewayId([0xab; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        let back: GatewayId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn gateway_id_rejects_short_keys() {
        assert!(GatewayId::from_hex("abcd").is_err());
        assert!(serde_json::from_str::<GatewayId>("\"zz\"").is_err());
    }

    #[test]
    fn gateway_id_display_is_prefixed() {
        let id = GatewayId([1; 32]);
        assert_eq!(id.to_string(), "gw:0101010101010101");
        assert_eq!(id.short(), "01010101");
    }
}
