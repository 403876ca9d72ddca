//! Oplog event model
//!
//! An [`OpLogEvent`] describes one entity mutation: encrypted payload, content
//! hash, per-device chain link, and the owning device's signature. Events are
//! immutable once created: conflict resolution happens on derived state, and
//! only retention cleanup ever deletes log rows.

use engram_core::{DeviceId, EngramError, EntityId, HlcTimestamp, OpId, Result};
use engram_crypto::wire::base64_blob;
use engram_crypto::{Hash256, SignatureBytes};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of replicated entity an event mutates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A stored memory
    Memory,
    /// A presentation overlay
    Overlay,
    /// Embedding metadata for a memory
    EmbeddingMeta,
    /// Key material exchange records
    Keyring,
    /// Device-spanning configuration
    Config,
}

impl EntityType {
    /// Stable wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Memory => "memory",
            EntityType::Overlay => "overlay",
            EntityType::EmbeddingMeta => "embedding_meta",
            EntityType::Keyring => "keyring",
            EntityType::Config => "config",
        }
    }

    /// All entity types, in wire order
    pub fn all() -> [EntityType; 5] {
        [
            EntityType::Memory,
            EntityType::Overlay,
            EntityType::EmbeddingMeta,
            EntityType::Keyring,
            EntityType::Config,
        ]
    }

    /// Whether replay materializes this type into a derived table
    pub fn is_materialized(&self) -> bool {
        matches!(
            self,
            EntityType::Memory | EntityType::Overlay | EntityType::EmbeddingMeta
        )
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = EngramError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory" => Ok(EntityType::Memory),
            "overlay" => Ok(EntityType::Overlay),
            "embedding_meta" => Ok(EntityType::EmbeddingMeta),
            "keyring" => Ok(EntityType::Keyring),
            "config" => Ok(EntityType::Config),
            other => Err(EngramError::malformed(format!(
                "unknown entity type '{other}'"
            ))),
        }
    }
}

/// Mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Entity creation
    Create,
    /// Entity update
    Update,
    /// Entity deletion (derived state keeps a tombstone)
    Delete,
}

impl OpKind {
    /// Stable wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = EngramError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(OpKind::Create),
            "update" => Ok(OpKind::Update),
            "delete" => Ok(OpKind::Delete),
            other => Err(EngramError::malformed(format!("unknown op kind '{other}'"))),
        }
    }
}

/// One signed, encrypted, hash-chained entity mutation
///
/// Created once by the owning device and never mutated afterwards. The
/// payload is encrypted under the owner's symmetric key; `hash` digests the
/// ciphertext, `prev_hash` links to the owner's previous event, and `sig`
/// covers `hash` with the owner's signing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpLogEvent {
    /// Time-ordered unique id; primary key in the event table
    pub op_id: OpId,
    /// Serialized [`HlcTimestamp`] assigned at creation
    pub hlc: String,
    /// Owning device
    pub device_id: DeviceId,
    /// Entity kind being mutated
    pub entity_type: EntityType,
    /// Stable entity id
    pub entity_id: EntityId,
    /// Mutation kind
    pub op: OpKind,
    /// Encrypted payload, nonce-prefixed
    #[serde(with = "base64_blob")]
    pub cipher_blob: Vec<u8>,
    /// Hash of the owner's previous event; `None` for the first
    pub prev_hash: Option<Hash256>,
    /// Digest of `cipher_blob`
    pub hash: Hash256,
    /// Owner's signature over `hash`
    pub sig: SignatureBytes,
}

impl OpLogEvent {
    /// Parse the event's timestamp
    pub fn timestamp(&self) -> Result<HlcTimestamp> {
        HlcTimestamp::parse(&self.hlc)
    }
}
