//! Read snapshots handed to callers
//!
//! Values are shared `Arc<Value>` snapshots. A caller wanting to edit one
//! clones it out first; the cached copy is never reachable mutably.

use crate::error::{SyncError, SyncResult};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use teamboard_types::EntityKey;

/// One entity as served by the sync layer
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub key: EntityKey,
    pub value: Arc<Value>,
}

impl DocumentSnapshot {
    pub fn new(key: EntityKey, value: Arc<Value>) -> Self {
        Self { key, value }
    }

    /// Decode into a typed model
    pub fn decode<T: DeserializeOwned>(&self) -> SyncResult<T> {
        T::deserialize(&*self.value).map_err(|source| SyncError::Decode {
            key: self.key.clone(),
            source,
        })
    }

    /// Owned, freely mutable copy of the value
    pub fn to_owned_value(&self) -> Value {
        (*self.value).clone()
    }
}

/// Ordered result of a query read
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub signature: String,
    pub documents: Vec<DocumentSnapshot>,
    /// Served entirely from the caches, no store round trip
    pub from_cache: bool,
}

impl QueryResult {
    pub fn keys(&self) -> Vec<EntityKey> {
        self.documents.iter().map(|d| d.key.clone()).collect()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.documents.iter().map(|d| d.key.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Decode every document, failing on the first that does not fit `T`
    pub fn decode<T: DeserializeOwned>(&self) -> SyncResult<Vec<T>> {
        self.documents.iter().map(DocumentSnapshot::decode).collect()
    }
}
