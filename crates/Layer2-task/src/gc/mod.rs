//! Garbage Collection
//!
//! Periodic eviction of idle, over-quota and over-budget containers, with
//! optional snapshots before removal.

mod backup;
mod collector;

pub use backup::{LocalDirStore, MemoryStore, SnapshotStore};
pub use collector::{EvictionReason, EvictionReport, Eviction, GarbageCollector};
