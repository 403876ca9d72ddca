//! Core identifier types used across Engram
//!
//! Device, entity, and operation identifiers. Device ids are normalized at
//! construction so they can appear unescaped inside a serialized timestamp.

use crate::error::{EngramError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum length of a normalized device id.
const DEVICE_ID_MAX_LEN: usize = 20;

/// Device identifier for one of the user's devices
///
/// Normalized at construction: lowercase, alphanumeric and hyphen only,
/// truncated to 20 characters. The restricted alphabet keeps the id safe to
/// embed unescaped inside a serialized [`HlcTimestamp`](crate::HlcTimestamp)
/// string, and string comparison of two device ids matches their ordering as
/// timestamp tiebreakers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device id, normalizing the input
    pub fn new(raw: impl AsRef<str>) -> Self {
        let normalized: String = raw
            .as_ref()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .take(DEVICE_ID_MAX_LEN)
            .collect();
        Self(normalized)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a string is already in normalized form
    pub fn is_normalized(raw: &str) -> bool {
        Self::new(raw).as_str() == raw
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = EngramError;

    fn from_str(s: &str) -> Result<Self> {
        let id = Self::new(s);
        if id.as_str().is_empty() {
            return Err(EngramError::invalid(format!(
                "device id '{s}' is empty after normalization"
            )));
        }
        Ok(id)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Stable identifier for a replicated entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Create an entity id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Time-ordered unique operation identifier
///
/// Zero-padded physical milliseconds, zero-padded logical counter, and the
/// issuing device. Each device's clock issues strictly increasing
/// `(physical, logical)` pairs, so the id is globally unique and
/// lexicographic order over op ids is emission order; the push watermark
/// depends on that.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(String);

impl OpId {
    /// Build the op id for a clock reading
    pub fn new(physical_ms: i64, logical: u32, device_id: &DeviceId) -> Self {
        Self(format!(
            "{:013}-{logical:010}-{device_id}",
            physical_ms.max(0)
        ))
    }

    /// Reconstruct from a stored string
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
