//! Derived-state replay
//!
//! Derived entities are materialized views rebuilt by folding verified events
//! through a pure reducer in HLC order. Conflicts resolve last-writer-wins:
//! among updates to the same entity, the event with the greater timestamp is
//! retained. Snapshots are cached reducer outputs, never authoritative.

use crate::event::{EntityType, OpKind, OpLogEvent};
use crate::verify::sort_events_by_hlc;
use engram_core::{DeviceId, EngramError, EntityId, Result};
use engram_crypto::wire::base64_blob;
use engram_crypto::CryptoProvider;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Materialized state of one entity
///
/// Carries the winning event's ciphertext rather than plaintext: payloads of
/// foreign events stay encrypted until a key-exchange channel exists, and
/// replay must not depend on decryptability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState {
    /// Stable entity id
    pub entity_id: EntityId,
    /// Device that authored the winning event
    pub device_id: DeviceId,
    /// Serialized timestamp of the last applying event
    pub hlc: String,
    /// Tombstone flag set by delete events
    pub deleted: bool,
    /// The winning event's encrypted payload (empty for tombstones)
    #[serde(with = "base64_blob")]
    pub cipher_blob: Vec<u8>,
}

impl EntityState {
    /// The state one event would leave behind, or `None` for entity types
    /// that are not materialized
    pub fn from_event(event: &OpLogEvent) -> Option<Self> {
        if !event.entity_type.is_materialized() {
            return None;
        }
        Some(match event.op {
            OpKind::Create | OpKind::Update => Self {
                entity_id: event.entity_id.clone(),
                device_id: event.device_id.clone(),
                hlc: event.hlc.clone(),
                deleted: false,
                cipher_blob: event.cipher_blob.clone(),
            },
            OpKind::Delete => Self {
                entity_id: event.entity_id.clone(),
                device_id: event.device_id.clone(),
                hlc: event.hlc.clone(),
                deleted: true,
                cipher_blob: Vec::new(),
            },
        })
    }
}

/// In-memory materialization of all derived entities
///
/// Keyed by `(entity_type, entity_id)`; only materialized entity types
/// (memory, overlay, embedding metadata) are held here. Keyring and config
/// events are consumed by their own subsystems.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedState {
    entities: BTreeMap<(EntityType, EntityId), EntityState>,
}

impl DerivedState {
    /// Empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Reducer step: fold one event into the state
    ///
    /// Pure with respect to inputs (no wall clock, no randomness), so any
    /// device folding the same event sequence reaches the same state.
    /// Returns whether the event won (changed state); an event older than the
    /// entity's current timestamp loses and leaves state untouched.
    pub fn apply(&mut self, event: &OpLogEvent) -> bool {
        let Some(state) = EntityState::from_event(event) else {
            return false;
        };

        let key = (event.entity_type, event.entity_id.clone());
        if let Some(existing) = self.entities.get(&key) {
            if event.hlc <= existing.hlc {
                return false;
            }
        }

        self.entities.insert(key, state);
        true
    }

    /// Rebuild state by replaying a full event set in HLC order
    pub fn replay(events: &[OpLogEvent]) -> Self {
        let mut ordered = events.to_vec();
        sort_events_by_hlc(&mut ordered);
        let mut state = Self::new();
        for event in &ordered {
            state.apply(event);
        }
        state
    }

    /// Look up one entity's state
    pub fn get(&self, entity_type: EntityType, entity_id: &EntityId) -> Option<&EntityState> {
        self.entities.get(&(entity_type, entity_id.clone()))
    }

    /// All live (non-tombstone) entities of a type
    pub fn live_entities(&self, entity_type: EntityType) -> Vec<&EntityState> {
        self.entities
            .iter()
            .filter(|((t, _), state)| *t == entity_type && !state.deleted)
            .map(|(_, state)| state)
            .collect()
    }

    /// Number of tracked entities, tombstones included
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether any entity is tracked
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Seed an entity from a restored snapshot, keeping the newer of the two
    /// if replay already produced one
    pub fn restore(&mut self, entity_type: EntityType, state: EntityState) {
        let key = (entity_type, state.entity_id.clone());
        match self.entities.get(&key) {
            Some(existing) if existing.hlc >= state.hlc => {}
            _ => {
                self.entities.insert(key, state);
            }
        }
    }
}

/// A decrypted memory, readable only on the authoring device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntity {
    /// Stable entity id
    pub entity_id: EntityId,
    /// Decrypted payload
    pub content: serde_json::Value,
    /// Serialized timestamp of the last applying event
    pub hlc: String,
}

/// A decrypted overlay, readable only on the authoring device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayEntity {
    /// Stable entity id
    pub entity_id: EntityId,
    /// Decrypted payload
    pub content: serde_json::Value,
    /// Serialized timestamp of the last applying event
    pub hlc: String,
}

/// Decrypted embedding metadata, readable only on the authoring device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingMeta {
    /// Stable entity id
    pub entity_id: EntityId,
    /// Decrypted payload
    pub content: serde_json::Value,
    /// Serialized timestamp of the last applying event
    pub hlc: String,
}

fn decrypt_state(
    crypto: &CryptoProvider,
    state: &EntityState,
) -> Result<Option<(serde_json::Value, String)>> {
    if state.deleted || &state.device_id != crypto.device_id() {
        // Tombstone, or a foreign payload this device holds no key for.
        return Ok(None);
    }
    let plaintext = crypto.decrypt(&state.cipher_blob)?;
    let content = serde_json::from_slice(&plaintext)
        .map_err(|e| EngramError::serialization(format!("payload decoding failed: {e}")))?;
    Ok(Some((content, state.hlc.clone())))
}

impl DerivedState {
    /// Decrypted view over this device's own live memories
    pub fn memories(&self, crypto: &CryptoProvider) -> Result<Vec<MemoryEntity>> {
        self.live_entities(EntityType::Memory)
            .into_iter()
            .filter_map(|state| {
                decrypt_state(crypto, state).transpose().map(|decrypted| {
                    decrypted.map(|(content, hlc)| MemoryEntity {
                        entity_id: state.entity_id.clone(),
                        content,
                        hlc,
                    })
                })
            })
            .collect()
    }

    /// Decrypted view over this device's own live overlays
    pub fn overlays(&self, crypto: &CryptoProvider) -> Result<Vec<OverlayEntity>> {
        self.live_entities(EntityType::Overlay)
            .into_iter()
            .filter_map(|state| {
                decrypt_state(crypto, state).transpose().map(|decrypted| {
                    decrypted.map(|(content, hlc)| OverlayEntity {
                        entity_id: state.entity_id.clone(),
                        content,
                        hlc,
                    })
                })
            })
            .collect()
    }

    /// Decrypted view over this device's own live embedding metadata
    pub fn embedding_meta(&self, crypto: &CryptoProvider) -> Result<Vec<EmbeddingMeta>> {
        self.live_entities(EntityType::EmbeddingMeta)
            .into_iter()
            .filter_map(|state| {
                decrypt_state(crypto, state).transpose().map(|decrypted| {
                    decrypted.map(|(content, hlc)| EmbeddingMeta {
                        entity_id: state.entity_id.clone(),
                        content,
                        hlc,
                    })
                })
            })
            .collect()
    }
}

/// Materialization checkpoint for one entity
///
/// A cached reducer output: replay may start from the snapshot instead of the
/// full log, and any later snapshot for the same key supersedes this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Entity kind
    pub entity_type: EntityType,
    /// Stable entity id
    pub entity_id: EntityId,
    /// Serialized timestamp the checkpointed state reflects
    pub hlc: String,
    /// Sealed [`EntityState`]
    #[serde(with = "base64_blob")]
    pub state_cipher: Vec<u8>,
}

impl Snapshot {
    /// Checkpoint one entity's state, sealed under this device's key
    pub fn capture(
        entity_type: EntityType,
        state: &EntityState,
        crypto: &CryptoProvider,
    ) -> Result<Self> {
        let encoded = bincode::serialize(state)
            .map_err(|e| EngramError::serialization(format!("snapshot encoding failed: {e}")))?;
        Ok(Self {
            entity_type,
            entity_id: state.entity_id.clone(),
            hlc: state.hlc.clone(),
            state_cipher: crypto.encrypt(&encoded)?,
        })
    }

    /// Unseal the checkpointed state
    pub fn restore(&self, crypto: &CryptoProvider) -> Result<EntityState> {
        let encoded = crypto.decrypt(&self.state_cipher)?;
        bincode::deserialize(&encoded)
            .map_err(|e| EngramError::serialization(format!("snapshot decoding failed: {e}")))
    }
}
