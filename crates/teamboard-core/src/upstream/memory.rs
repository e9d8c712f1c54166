//! In-memory document store
//!
//! A complete [`DocumentStore`] backed by process memory. Used by tests,
//! benchmarks and local demos in place of the managed document store.
//! It behaves like the real thing where the sync layer cares:
//! - every commit gets a strictly increasing sequence number
//! - feed events for a key are emitted in commit order
//! - listeners that fall behind are disconnected rather than buffered forever
//!
//! Knobs for failure injection: latency, a one-shot write rejection,
//! unavailability, and dropping every open feed.

use super::{ChangeFeed, DocumentStore, ListenerId};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use teamboard_types::{ChangeEvent, EntityKey, QuerySpec, StoredDocument};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Default per-listener buffer before a lagging listener is dropped
const DEFAULT_FEED_CAPACITY: usize = 256;

struct Listener {
    scope: QuerySpec,
    sender: mpsc::Sender<ChangeEvent>,
}

/// Process-local document store with change feeds
pub struct InMemoryDocumentStore {
    documents: DashMap<EntityKey, StoredDocument>,
    /// Serializes commits so sequence order == emission order
    commit_lock: Mutex<()>,
    sequence: AtomicU64,
    listeners: DashMap<ListenerId, Listener>,
    next_listener: AtomicU64,
    feed_capacity: usize,
    latency: RwLock<Duration>,
    reject_next_write: AtomicBool,
    unavailable: AtomicBool,
    entity_fetches: AtomicU64,
    query_fetches: AtomicU64,
    writes: AtomicU64,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_feed_capacity(feed_capacity: usize) -> Self {
        Self {
            documents: DashMap::new(),
            commit_lock: Mutex::new(()),
            sequence: AtomicU64::new(0),
            listeners: DashMap::new(),
            next_listener: AtomicU64::new(1),
            feed_capacity: feed_capacity.max(1),
            latency: RwLock::new(Duration::ZERO),
            reject_next_write: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            entity_fetches: AtomicU64::new(0),
            query_fetches: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    // ===================
    // Direct mutation (another session's writes)
    // ===================

    /// Create or replace a document, emitting a feed event
    pub fn upsert(&self, key: EntityKey, value: Value) -> StoredDocument {
        let _guard = self.commit_lock.lock();
        self.commit_upsert(key, value)
    }

    /// Delete a document, emitting a tombstone. Returns the tombstone sequence.
    pub fn delete(&self, key: &EntityKey) -> Option<u64> {
        let _guard = self.commit_lock.lock();
        let (_, previous) = self.documents.remove(key)?;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let event = ChangeEvent::tombstone(key.clone(), sequence);
        self.broadcast(&event, Some(&previous.value));
        Some(sequence)
    }

    pub fn get(&self, key: &EntityKey) -> Option<StoredDocument> {
        self.documents.get(key).map(|d| d.value().clone())
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    // ===================
    // Failure injection
    // ===================

    /// Delay applied to every async call
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Reject the next write with a conflict, whatever its base version
    pub fn reject_next_write(&self) {
        self.reject_next_write.store(true, Ordering::SeqCst);
    }

    /// Fail every call (and feed registration) while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drop every open listener as if the connection was lost
    pub fn disconnect_all_feeds(&self) -> usize {
        let count = self.listeners.len();
        self.listeners.clear();
        debug!(count, "Disconnected all change feeds");
        count
    }

    // ===================
    // Accounting
    // ===================

    /// Number of registered change-feed listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn entity_fetch_count(&self) -> u64 {
        self.entity_fetches.load(Ordering::Relaxed)
    }

    pub fn query_fetch_count(&self) -> u64 {
        self.query_fetches.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    // ===================
    // Internals
    // ===================

    /// Caller must hold `commit_lock`
    fn commit_upsert(&self, key: EntityKey, value: Value) -> StoredDocument {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let document = StoredDocument {
            key: key.clone(),
            value,
            version: sequence,
        };
        let previous = self.documents.insert(key.clone(), document.clone());
        let event = ChangeEvent::upsert(key, document.value.clone(), sequence);
        self.broadcast(&event, previous.as_ref().map(|p| &p.value));
        document
    }

    fn broadcast(&self, event: &ChangeEvent, previous: Option<&Value>) {
        let mut dropped = Vec::new();

        for entry in self.listeners.iter() {
            let listener = entry.value();
            if listener.scope.kind != event.key.kind() {
                continue;
            }
            let relevant = event.value().is_some_and(|v| listener.scope.matches(v))
                || previous.is_some_and(|v| listener.scope.matches(v));
            if !relevant {
                continue;
            }

            match listener.sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(listener = %entry.key(), "Change feed listener lagging, disconnecting");
                    dropped.push(*entry.key());
                }
                Err(TrySendError::Closed(_)) => dropped.push(*entry.key()),
            }
        }

        for id in dropped {
            self.listeners.remove(&id);
        }
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_available(&self) -> SyncResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::store("store unavailable"));
        }
        Ok(())
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn fetch_entity(&self, key: &EntityKey) -> SyncResult<Option<StoredDocument>> {
        self.simulate_latency().await;
        self.check_available()?;
        self.entity_fetches.fetch_add(1, Ordering::Relaxed);
        Ok(self.get(key))
    }

    async fn fetch_query(&self, spec: &QuerySpec) -> SyncResult<Vec<StoredDocument>> {
        self.simulate_latency().await;
        self.check_available()?;
        self.query_fetches.fetch_add(1, Ordering::Relaxed);

        let mut results: Vec<StoredDocument> = self
            .documents
            .iter()
            .filter(|d| d.key().kind() == spec.kind && spec.matches(&d.value().value))
            .map(|d| d.value().clone())
            .collect();

        results.sort_by(|a, b| spec.compare(&a.value, &b.value).then_with(|| a.key.cmp(&b.key)));
        if let Some(limit) = spec.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn write_entity(
        &self,
        key: &EntityKey,
        value: Value,
        expected_version: Option<u64>,
    ) -> SyncResult<StoredDocument> {
        self.simulate_latency().await;
        self.check_available()?;

        let _guard = self.commit_lock.lock();
        let current_version = self.documents.get(key).map(|d| d.version);

        if self.reject_next_write.swap(false, Ordering::SeqCst) {
            return Err(SyncError::WriteConflict {
                key: key.clone(),
                current_version,
            });
        }
        if let Some(expected) = expected_version {
            if current_version != Some(expected) {
                return Err(SyncError::WriteConflict {
                    key: key.clone(),
                    current_version,
                });
            }
        }

        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(self.commit_upsert(key.clone(), value))
    }

    fn open_change_feed(&self, scope: &QuerySpec) -> SyncResult<ChangeFeed> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::FeedDisconnected {
                scope: scope.signature(),
                reason: "store unavailable".to_string(),
            });
        }

        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let (sender, events) = mpsc::channel(self.feed_capacity);
        self.listeners.insert(
            id,
            Listener {
                scope: scope.clone(),
                sender,
            },
        );
        debug!(listener = %id, scope = %scope, "Change feed opened");
        Ok(ChangeFeed { id, events })
    }

    fn close_change_feed(&self, id: ListenerId) {
        if self.listeners.remove(&id).is_some() {
            debug!(listener = %id, "Change feed closed");
        }
    }
}
