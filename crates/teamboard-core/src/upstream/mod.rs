//! Interface to the authoritative document store
//!
//! The sync layer never talks to a database directly. Everything upstream
//! goes through [`DocumentStore`]: point fetches, ordered query fetches,
//! versioned writes, and per-scope change feeds.

pub mod memory;

pub use memory::InMemoryDocumentStore;

use crate::error::SyncResult;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use teamboard_types::{ChangeEvent, EntityKey, QuerySpec, StoredDocument};
use tokio::sync::mpsc;

/// Identifier of one registered change-feed listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// A live change feed for one scope
///
/// The channel closing means the upstream dropped the listener; the consumer
/// must reopen the feed and treat the gap as unknown.
pub struct ChangeFeed {
    pub id: ListenerId,
    pub events: mpsc::Receiver<ChangeEvent>,
}

impl fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ChangeFeed").field("id", &self.id).finish()
    }
}

/// The persistent store consumed by the sync layer
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Fetch one entity. `Ok(None)` means it does not exist upstream.
    async fn fetch_entity(&self, key: &EntityKey) -> SyncResult<Option<StoredDocument>>;

    /// Fetch the ordered result of a query
    async fn fetch_query(&self, spec: &QuerySpec) -> SyncResult<Vec<StoredDocument>>;

    /// Write an entity and return the committed document
    ///
    /// When `expected_version` is set and differs from the stored version the
    /// store rejects the write with `SyncError::WriteConflict`.
    async fn write_entity(
        &self,
        key: &EntityKey,
        value: Value,
        expected_version: Option<u64>,
    ) -> SyncResult<StoredDocument>;

    /// Register a change-feed listener for every entity that matches `scope`
    /// either before or after a mutation.
    fn open_change_feed(&self, scope: &QuerySpec) -> SyncResult<ChangeFeed>;

    /// Deregister a listener. Idempotent.
    fn close_change_feed(&self, id: ListenerId);
}
