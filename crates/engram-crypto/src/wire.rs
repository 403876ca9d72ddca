//! Serde helpers for wire encodings
//!
//! Reusable `#[serde(with = "...")]` modules for fields that cross the relay
//! as JSON: binary blobs travel base64, fixed-size keys and nonces travel hex.

use serde::{Deserialize, Deserializer, Serializer};

/// Serde module for binary blobs as base64 strings
pub mod base64_blob {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    /// Serialize bytes as a base64 string
    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    /// Deserialize bytes from a base64 string
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Serde module for 32-byte keys as hex strings
pub mod hex_key {
    use super::*;

    /// Serialize a 32-byte key as hex
    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    /// Deserialize a 32-byte key from hex
    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(&s, &mut bytes).map_err(serde::de::Error::custom)?;
        Ok(bytes)
    }
}

/// Serde module for 16-byte nonces as hex strings
pub mod hex_nonce {
    use super::*;

    /// Serialize a 16-byte nonce as hex
    pub fn serialize<S>(bytes: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    /// Deserialize a 16-byte nonce from hex
    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 16], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(&s, &mut bytes).map_err(serde::de::Error::custom)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Container {
        #[serde(with = "super::base64_blob")]
        blob: Vec<u8>,
        #[serde(with = "super::hex_key")]
        key: [u8; 32],
        #[serde(with = "super::hex_nonce")]
        nonce: [u8; 16],
    }

    #[test]
    fn test_wire_roundtrip() {
        let container = Container {
            blob: vec![1, 2, 3, 255],
            key: [9u8; 32],
            nonce: [4u8; 16],
        };
        let json = serde_json::to_string(&container).unwrap();
        let back: Container = serde_json::from_str(&json).unwrap();
        assert_eq!(back, container);
    }

    #[test]
    fn test_blob_is_base64_string() {
        let container = Container {
            blob: vec![0u8; 3],
            key: [0u8; 32],
            nonce: [0u8; 16],
        };
        let json = serde_json::to_string(&container).unwrap();
        assert!(json.contains("\"AAAA\""));
    }
}
