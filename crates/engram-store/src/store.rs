//! The local store
//!
//! Single SQLite connection behind a mutex: the store is the only shared
//! mutable resource per device, and its writers (local event creation, the
//! sync cycle, periodic cleanup) are serialized by design.

use crate::key::StoreKey;
use crate::schema;
use engram_core::{DeviceClockState, DeviceId, EngramError, EntityId, HlcTimestamp, OpId, Result};
use engram_crypto::{sealed, Hash256, ProviderRecord, SignatureBytes};
use engram_journal::{EntityState, EntityType, OpLogEvent, Snapshot};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Per-device chain bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainState {
    /// Hash of the device's most recent accepted event
    pub tail_hash: Option<Hash256>,
    /// Cleared when a chain break is detected; acceptance halts until
    /// reconciled
    pub consistent: bool,
}

/// Durable, encrypted local store
pub struct LocalStore {
    conn: Mutex<Connection>,
    key: StoreKey,
}

fn db_err(e: rusqlite::Error) -> EngramError {
    EngramError::storage(e.to_string())
}

impl LocalStore {
    /// Open (or create) the store at a path
    pub fn open(path: &Path, key: StoreKey) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        schema::init_schema(&conn).map_err(db_err)?;
        info!(path = %path.display(), "local store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            key,
        })
    }

    /// Open an in-memory store (tests, ephemeral devices)
    pub fn open_in_memory(key: StoreKey) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        schema::init_schema(&conn).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            key,
        })
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Append one event; duplicate op ids are ignored
    ///
    /// Returns whether a row was inserted, so callers can tell a fresh event
    /// from an idempotent replay.
    pub fn insert_event(&self, event: &OpLogEvent) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO events
                 (op_id, hlc, device_id, entity_type, entity_id, op, cipher_blob, prev_hash, hash, sig)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    event.op_id.as_str(),
                    event.hlc,
                    event.device_id.as_str(),
                    event.entity_type.as_str(),
                    event.entity_id.as_str(),
                    event.op.as_str(),
                    event.cipher_blob,
                    event.prev_hash.map(|h| h.to_hex()),
                    event.hash.to_hex(),
                    event.sig.to_hex(),
                ],
            )
            .map_err(db_err)?;
        Ok(inserted > 0)
    }

    /// Append a batch of events in one transaction; returns how many were new
    pub fn insert_events(&self, events: &[OpLogEvent]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let mut fresh = 0;
        for event in events {
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO events
                     (op_id, hlc, device_id, entity_type, entity_id, op, cipher_blob, prev_hash, hash, sig)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        event.op_id.as_str(),
                        event.hlc,
                        event.device_id.as_str(),
                        event.entity_type.as_str(),
                        event.entity_id.as_str(),
                        event.op.as_str(),
                        event.cipher_blob,
                        event.prev_hash.map(|h| h.to_hex()),
                        event.hash.to_hex(),
                        event.sig.to_hex(),
                    ],
                )
                .map_err(db_err)?;
            fresh += inserted;
        }
        tx.commit().map_err(db_err)?;
        Ok(fresh)
    }

    /// Append one of this device's own events and advance its chain tail
    pub fn append_own_event(&self, event: &OpLogEvent) -> Result<bool> {
        let fresh = self.insert_event(event)?;
        if fresh {
            self.set_chain_tail(&event.device_id, &event.hash)?;
        }
        Ok(fresh)
    }

    /// Whether an op id is already stored
    pub fn has_event(&self, op_id: &OpId) -> Result<bool> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT 1 FROM events WHERE op_id = ?1",
            params![op_id.as_str()],
            |_| Ok(()),
        )
        .optional()
        .map_err(db_err)
        .map(|row| row.is_some())
    }

    /// Events with `hlc` strictly greater than the watermark, ascending
    pub fn events_since(&self, after: Option<&HlcTimestamp>) -> Result<Vec<OpLogEvent>> {
        let conn = self.conn.lock();
        let (sql, watermark) = match after {
            Some(ts) => (
                "SELECT op_id, hlc, device_id, entity_type, entity_id, op, cipher_blob, prev_hash, hash, sig
                 FROM events WHERE hlc > ?1 ORDER BY hlc ASC, op_id ASC",
                Some(ts.stringify()),
            ),
            None => (
                "SELECT op_id, hlc, device_id, entity_type, entity_id, op, cipher_blob, prev_hash, hash, sig
                 FROM events ORDER BY hlc ASC, op_id ASC",
                None,
            ),
        };
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = match watermark {
            Some(w) => stmt.query_map(params![w], read_event_row),
            None => stmt.query_map([], read_event_row),
        }
        .map_err(db_err)?;
        collect_events(rows)
    }

    /// One device's events in emission (op id) order, optionally after a
    /// previously pushed op id
    pub fn device_events_after(
        &self,
        device_id: &DeviceId,
        after_op: Option<&OpId>,
    ) -> Result<Vec<OpLogEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT op_id, hlc, device_id, entity_type, entity_id, op, cipher_blob, prev_hash, hash, sig
                 FROM events WHERE device_id = ?1 AND op_id > ?2 ORDER BY op_id ASC",
            )
            .map_err(db_err)?;
        let floor = after_op.map(|op| op.as_str().to_string()).unwrap_or_default();
        let rows = stmt
            .query_map(params![device_id.as_str(), floor], read_event_row)
            .map_err(db_err)?;
        collect_events(rows)
    }

    /// Whether a device has a stored event with the given content hash
    ///
    /// Distinguishes a chain gap (predecessor never arrived) from a fork or
    /// reorder (predecessor present but not the tail).
    pub fn has_device_event_with_hash(&self, device_id: &DeviceId, hash: &Hash256) -> Result<bool> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT 1 FROM events WHERE device_id = ?1 AND hash = ?2 LIMIT 1",
            params![device_id.as_str(), hash.to_hex()],
            |_| Ok(()),
        )
        .optional()
        .map_err(db_err)
        .map(|row| row.is_some())
    }

    /// Greatest stored timestamp; the local pull watermark
    pub fn latest_hlc(&self) -> Result<Option<HlcTimestamp>> {
        let conn = self.conn.lock();
        let max: Option<String> = conn
            .query_row("SELECT MAX(hlc) FROM events", [], |row| row.get(0))
            .map_err(db_err)?;
        max.map(|s| HlcTimestamp::parse(&s)).transpose()
    }

    /// Total number of stored events
    pub fn event_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .map_err(db_err)
    }

    // ------------------------------------------------------------------
    // Clock state
    // ------------------------------------------------------------------

    /// Persist a device's clock snapshot
    pub fn save_clock_state(&self, state: &DeviceClockState) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO device_clock (device_id, last_hlc, lamport_counter)
             VALUES (?1, ?2, ?3)",
            params![
                state.device_id.as_str(),
                state.last_hlc.stringify(),
                state.lamport_counter as i64,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Load a device's clock snapshot
    pub fn load_clock_state(&self, device_id: &DeviceId) -> Result<Option<DeviceClockState>> {
        let conn = self.conn.lock();
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT last_hlc, lamport_counter FROM device_clock WHERE device_id = ?1",
                params![device_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;
        row.map(|(last_hlc, lamport_counter)| {
            Ok(DeviceClockState {
                device_id: device_id.clone(),
                last_hlc: HlcTimestamp::parse(&last_hlc)?,
                lamport_counter: lamport_counter as u64,
            })
        })
        .transpose()
    }

    // ------------------------------------------------------------------
    // Derived entities
    // ------------------------------------------------------------------

    /// Apply an entity state to its derived table, last-writer-wins
    ///
    /// Returns whether the state won. The record is sealed under the store
    /// key before it touches disk.
    pub fn apply_derived(&self, entity_type: EntityType, state: &EntityState) -> Result<bool> {
        let table = derived_table(entity_type)?;
        let conn = self.conn.lock();

        let existing: Option<String> = conn
            .query_row(
                &format!("SELECT hlc FROM {table} WHERE entity_id = ?1"),
                params![state.entity_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if let Some(existing) = existing {
            if state.hlc <= existing {
                return Ok(false);
            }
        }

        let encoded = bincode::serialize(state)
            .map_err(|e| EngramError::serialization(format!("entity encoding failed: {e}")))?;
        let record_cipher = sealed::seal(self.key.as_bytes(), &encoded)?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {table} (entity_id, hlc, deleted, record_cipher)
                 VALUES (?1, ?2, ?3, ?4)"
            ),
            params![
                state.entity_id.as_str(),
                state.hlc,
                state.deleted as i64,
                record_cipher,
            ],
        )
        .map_err(db_err)?;
        Ok(true)
    }

    /// Load one derived entity
    pub fn derived_entity(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
    ) -> Result<Option<EntityState>> {
        let table = derived_table(entity_type)?;
        let conn = self.conn.lock();
        let record: Option<Vec<u8>> = conn
            .query_row(
                &format!("SELECT record_cipher FROM {table} WHERE entity_id = ?1"),
                params![entity_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        record.map(|cipher| self.unseal_entity(&cipher)).transpose()
    }

    /// Load all derived entities of a type, tombstones included
    pub fn derived_entities(&self, entity_type: EntityType) -> Result<Vec<EntityState>> {
        let table = derived_table(entity_type)?;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT record_cipher FROM {table} ORDER BY entity_id ASC"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))
            .map_err(db_err)?;
        let mut entities = Vec::new();
        for cipher in rows {
            entities.push(self.unseal_entity(&cipher.map_err(db_err)?)?);
        }
        Ok(entities)
    }

    fn unseal_entity(&self, cipher: &[u8]) -> Result<EntityState> {
        let encoded = sealed::unseal(self.key.as_bytes(), cipher)?;
        bincode::deserialize(&encoded)
            .map_err(|e| EngramError::serialization(format!("entity decoding failed: {e}")))
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Store a snapshot, superseding any earlier one for the same key
    pub fn replace_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO snapshots (entity_type, entity_id, hlc, state_cipher)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.entity_type.as_str(),
                snapshot.entity_id.as_str(),
                snapshot.hlc,
                snapshot.state_cipher,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Load the snapshot for an entity, if any
    pub fn snapshot(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
    ) -> Result<Option<Snapshot>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT hlc, state_cipher FROM snapshots WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity_type.as_str(), entity_id.as_str()],
            |row| {
                Ok(Snapshot {
                    entity_type,
                    entity_id: entity_id.clone(),
                    hlc: row.get(0)?,
                    state_cipher: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    // ------------------------------------------------------------------
    // Keyring
    // ------------------------------------------------------------------

    /// Persist a device's provider record, sealed under the store key
    pub fn save_keyring(&self, record: &ProviderRecord) -> Result<()> {
        let encoded = bincode::serialize(record)
            .map_err(|e| EngramError::serialization(format!("keyring encoding failed: {e}")))?;
        let record_cipher = sealed::seal(self.key.as_bytes(), &encoded)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO keyring (device_id, record_cipher) VALUES (?1, ?2)",
            params![record.keypair.device_id.as_str(), record_cipher],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Load a device's provider record
    pub fn load_keyring(&self, device_id: &DeviceId) -> Result<Option<ProviderRecord>> {
        let conn = self.conn.lock();
        let cipher: Option<Vec<u8>> = conn
            .query_row(
                "SELECT record_cipher FROM keyring WHERE device_id = ?1",
                params![device_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        cipher
            .map(|cipher| {
                let encoded = sealed::unseal(self.key.as_bytes(), &cipher)?;
                bincode::deserialize(&encoded).map_err(|e| {
                    EngramError::serialization(format!("keyring decoding failed: {e}"))
                })
            })
            .transpose()
    }

    // ------------------------------------------------------------------
    // Chain state
    // ------------------------------------------------------------------

    /// Per-device chain tail and consistency flag
    pub fn chain_state(&self, device_id: &DeviceId) -> Result<Option<ChainState>> {
        let conn = self.conn.lock();
        let row: Option<(Option<String>, i64)> = conn
            .query_row(
                "SELECT tail_hash, consistent FROM chain_state WHERE device_id = ?1",
                params![device_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;
        row.map(|(tail, consistent)| {
            Ok(ChainState {
                tail_hash: tail
                    .map(|hex| {
                        Hash256::from_hex(&hex).map_err(|e| {
                            EngramError::storage(format!("corrupt chain tail for {device_id}: {e}"))
                        })
                    })
                    .transpose()?,
                consistent: consistent != 0,
            })
        })
        .transpose()
    }

    /// Advance a device's chain tail after accepting an event
    pub fn set_chain_tail(&self, device_id: &DeviceId, tail: &Hash256) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chain_state (device_id, tail_hash, consistent) VALUES (?1, ?2, 1)
             ON CONFLICT(device_id) DO UPDATE SET tail_hash = ?2",
            params![device_id.as_str(), tail.to_hex()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Flag a device's chain as inconsistent; acceptance halts until the
    /// flag is explicitly cleared by reconciliation
    pub fn mark_chain_inconsistent(&self, device_id: &DeviceId) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chain_state (device_id, tail_hash, consistent) VALUES (?1, NULL, 0)
             ON CONFLICT(device_id) DO UPDATE SET consistent = 0",
            params![device_id.as_str()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Reconcile a device's chain: clear the inconsistency flag and recompute
    /// the tail from stored history
    pub fn reset_chain(&self, device_id: &DeviceId) -> Result<()> {
        let tail: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT hash FROM events WHERE device_id = ?1 ORDER BY hlc DESC, op_id DESC LIMIT 1",
                params![device_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO chain_state (device_id, tail_hash, consistent) VALUES (?1, ?2, 1)",
            params![device_id.as_str(), tail],
        )
        .map_err(db_err)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sync bookkeeping
    // ------------------------------------------------------------------

    /// Read a sync bookkeeping value
    pub fn sync_value(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM sync_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    /// Write a sync bookkeeping value
    pub fn set_sync_value(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO sync_state (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(db_err)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Retention cleanup: delete events older than the watermark whose
    /// entity has a snapshot at or past the event
    ///
    /// The log stays the source of truth for everything not snapshotted.
    pub fn prune_events_before(&self, watermark: &HlcTimestamp) -> Result<usize> {
        let conn = self.conn.lock();
        let pruned = conn
            .execute(
                "DELETE FROM events WHERE hlc < ?1 AND EXISTS (
                     SELECT 1 FROM snapshots s
                     WHERE s.entity_type = events.entity_type
                       AND s.entity_id = events.entity_id
                       AND s.hlc >= events.hlc
                 )",
                params![watermark.stringify()],
            )
            .map_err(db_err)?;
        if pruned > 0 {
            debug!(pruned, "retention pruned events");
        }
        Ok(pruned)
    }

    /// Reclaim disk space after pruning
    pub fn vacuum(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("VACUUM").map_err(db_err)
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LocalStore(..)")
    }
}

fn derived_table(entity_type: EntityType) -> Result<&'static str> {
    match entity_type {
        EntityType::Memory => Ok("memories"),
        EntityType::Overlay => Ok("overlays"),
        EntityType::EmbeddingMeta => Ok("embedding_meta"),
        other => Err(EngramError::invalid(format!(
            "entity type '{other}' has no derived table"
        ))),
    }
}

struct RawEventRow {
    op_id: String,
    hlc: String,
    device_id: String,
    entity_type: String,
    entity_id: String,
    op: String,
    cipher_blob: Vec<u8>,
    prev_hash: Option<String>,
    hash: String,
    sig: String,
}

fn read_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEventRow> {
    Ok(RawEventRow {
        op_id: row.get(0)?,
        hlc: row.get(1)?,
        device_id: row.get(2)?,
        entity_type: row.get(3)?,
        entity_id: row.get(4)?,
        op: row.get(5)?,
        cipher_blob: row.get(6)?,
        prev_hash: row.get(7)?,
        hash: row.get(8)?,
        sig: row.get(9)?,
    })
}

fn collect_events(
    rows: impl Iterator<Item = rusqlite::Result<RawEventRow>>,
) -> Result<Vec<OpLogEvent>> {
    let mut events = Vec::new();
    for row in rows {
        let raw = row.map_err(db_err)?;
        events.push(OpLogEvent {
            op_id: OpId::from_string(raw.op_id),
            hlc: raw.hlc,
            device_id: DeviceId::new(raw.device_id),
            entity_type: EntityType::from_str(&raw.entity_type)?,
            entity_id: EntityId::new(raw.entity_id),
            op: engram_journal::OpKind::from_str(&raw.op)?,
            cipher_blob: raw.cipher_blob,
            prev_hash: raw
                .prev_hash
                .map(|hex| {
                    Hash256::from_hex(&hex)
                        .map_err(|e| EngramError::storage(format!("corrupt prev_hash: {e}")))
                })
                .transpose()?,
            hash: Hash256::from_hex(&raw.hash)
                .map_err(|e| EngramError::storage(format!("corrupt hash: {e}")))?,
            sig: SignatureBytes::from_hex(&raw.sig)
                .map_err(|e| EngramError::storage(format!("corrupt signature: {e}")))?,
        });
    }
    Ok(events)
}
