//! Engram store: durable encrypted persistence
//!
//! SQLite tables for the append-only event log, per-device clock state,
//! materialized derived entities, snapshots, the sealed keyring, and sync
//! bookkeeping. The store opens under an at-rest key generated once per
//! device and held only on-device.

pub mod key;
pub mod schema;
pub mod store;

pub use key::StoreKey;
pub use store::{ChainState, LocalStore};
