//! Engram journal: the append-only oplog and its derived state
//!
//! Events are the source of truth: signed, encrypted, hash-chained records of
//! entity mutations. Everything user-visible is a materialized view rebuilt
//! by replaying verified events in HLC order.

pub mod event;
pub mod factory;
pub mod replay;
pub mod verify;

pub use event::{EntityType, OpKind, OpLogEvent};
pub use factory::EventFactory;
pub use replay::{
    DerivedState, EmbeddingMeta, EntityState, MemoryEntity, OverlayEntity, Snapshot,
};
pub use verify::{filter_events_since, sort_events_by_hlc, validate_device_chain, verify_event};
