//! SQLite schema
//!
//! Serialized HLC strings are order-preserving, so the `hlc` columns support
//! `>` range scans and `MAX()` directly.

use rusqlite::Connection;

/// Create all tables and indexes if they do not exist yet.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS events (
            op_id       TEXT PRIMARY KEY,
            hlc         TEXT NOT NULL,
            device_id   TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id   TEXT NOT NULL,
            op          TEXT NOT NULL,
            cipher_blob BLOB NOT NULL,
            prev_hash   TEXT,
            hash        TEXT NOT NULL,
            sig         TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_hlc ON events(hlc);
        CREATE INDEX IF NOT EXISTS idx_events_device_op ON events(device_id, op_id);

        CREATE TABLE IF NOT EXISTS device_clock (
            device_id       TEXT PRIMARY KEY,
            last_hlc        TEXT NOT NULL,
            lamport_counter INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS memories (
            entity_id     TEXT PRIMARY KEY,
            hlc           TEXT NOT NULL,
            deleted       INTEGER NOT NULL,
            record_cipher BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS overlays (
            entity_id     TEXT PRIMARY KEY,
            hlc           TEXT NOT NULL,
            deleted       INTEGER NOT NULL,
            record_cipher BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS embedding_meta (
            entity_id     TEXT PRIMARY KEY,
            hlc           TEXT NOT NULL,
            deleted       INTEGER NOT NULL,
            record_cipher BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS snapshots (
            entity_type  TEXT NOT NULL,
            entity_id    TEXT NOT NULL,
            hlc          TEXT NOT NULL,
            state_cipher BLOB NOT NULL,
            PRIMARY KEY (entity_type, entity_id)
        );

        CREATE TABLE IF NOT EXISTS keyring (
            device_id     TEXT PRIMARY KEY,
            record_cipher BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chain_state (
            device_id  TEXT PRIMARY KEY,
            tail_hash  TEXT,
            consistent INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS sync_state (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )
}
