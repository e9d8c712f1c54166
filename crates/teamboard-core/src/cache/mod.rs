//! In-memory caches owned by the coordinator
//!
//! - `entity_cache`: per-kind TTL + LRU store of entity snapshots
//! - `query_cache`: ordered result keys with dependency-driven invalidation

pub mod entity_cache;
pub mod query_cache;

pub use entity_cache::{EntityCache, Lookup};
pub use query_cache::{EpochStamp, QueryCache};
