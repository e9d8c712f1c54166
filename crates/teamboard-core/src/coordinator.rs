//! Invalidation coordinator: the only writer of cache state
//!
//! Every mutation goes through here so cache contents and subscription
//! dispatch never diverge:
//!
//! - local write: optimistic update, query invalidation, subscriber enqueue,
//!   store write, then commit or roll back
//! - feed event: the same first three steps, ordered per key by the feed's
//!   sequence number
//! - fetch on miss: populates the caches unless a newer event already landed
//!
//! Per-key ordering is enforced by the `applied` map. Its entry lock for a
//! key is held while that key's cache entry is mutated, so two writers of
//! the same key are serialized and a lower sequence never overwrites a
//! higher one. Query invalidation always runs after the entity update.

use crate::cache::{EntityCache, Lookup, QueryCache};
use crate::config::SyncConfig;
use crate::document::{DocumentSnapshot, QueryResult};
use crate::error::{SyncError, SyncResult};
use crate::event::{EventBus, SyncEvent};
use crate::subscription::SubscriptionRegistry;
use crate::upstream::DocumentStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use moka::future::Cache;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use teamboard_types::{Change, ChangeEvent, EntityKey, EntityKind, QuerySpec, StoredDocument};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Upper bound on remembered NotFound keys
const NEGATIVE_CACHE_CAPACITY: u64 = 10_000;

/// Last feed sequence applied for a key
#[derive(Debug, Clone, Copy)]
struct AppliedVersion {
    sequence: u64,
    /// False after a tombstone
    live: bool,
    touched: Instant,
}

impl AppliedVersion {
    fn unseen() -> Self {
        Self {
            sequence: 0,
            live: false,
            touched: Instant::now(),
        }
    }

    fn expected_version(&self) -> Option<u64> {
        (self.live && self.sequence > 0).then_some(self.sequence)
    }
}

/// Routes writes, feed events and fetches into the caches and subscribers
pub struct InvalidationCoordinator {
    config: SyncConfig,
    store: Arc<dyn DocumentStore>,
    entities: EntityCache,
    queries: QueryCache,
    /// Key -> expiry of a cached NotFound
    negative: Cache<EntityKey, Instant>,
    applied: DashMap<EntityKey, AppliedVersion>,
    registry: Arc<SubscriptionRegistry>,
    events: EventBus,
}

impl InvalidationCoordinator {
    pub fn new(config: SyncConfig, store: Arc<dyn DocumentStore>, events: EventBus) -> Self {
        let negative = Cache::builder()
            .max_capacity(NEGATIVE_CACHE_CAPACITY)
            .time_to_live(config.negative_ttl())
            .build();

        Self {
            entities: EntityCache::new(&config.entities),
            queries: QueryCache::new(config.queries),
            negative,
            applied: DashMap::new(),
            registry: Arc::new(SubscriptionRegistry::new()),
            events,
            store,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn entities(&self) -> &EntityCache {
        &self.entities
    }

    pub fn queries(&self) -> &QueryCache {
        &self.queries
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Last applied feed sequence for a key, if remembered
    pub fn applied_sequence(&self, key: &EntityKey) -> Option<u64> {
        self.applied.get(key).map(|v| v.sequence)
    }

    // ===================
    // Reads
    // ===================

    /// Serve an entity from cache, fetching on miss
    pub async fn read(&self, key: &EntityKey) -> SyncResult<DocumentSnapshot> {
        match self.entities.get(key) {
            Lookup::Hit(value) => return Ok(DocumentSnapshot::new(key.clone(), value)),
            Lookup::Expired => self.handle_dropped(std::slice::from_ref(key)),
            Lookup::Miss => {}
        }

        if self.is_known_missing(key).await {
            trace!(key = %key, "Negative cache hit");
            return Err(SyncError::NotFound { key: key.clone() });
        }

        let seen_before = self.applied_sequence(key);
        let fetched = self
            .with_timeout(|| format!("fetch {}", key), self.store.fetch_entity(key))
            .await?;

        match fetched {
            Some(document) => Ok(DocumentSnapshot::new(key.clone(), self.apply_fetched(document))),
            None => {
                // A feed event raced the fetch; trust the feed
                if self.applied_sequence(key) != seen_before {
                    if let Some(value) = self.entities.peek(key) {
                        return Ok(DocumentSnapshot::new(key.clone(), value));
                    }
                } else {
                    self.remember_missing(key).await;
                }
                Err(SyncError::NotFound { key: key.clone() })
            }
        }
    }

    /// Serve a query from cache, refetching when the ordering or any of its
    /// entities is gone
    pub async fn read_query(&self, spec: &QuerySpec) -> SyncResult<QueryResult> {
        let signature = spec.signature();

        if let Some(keys) = self.queries.get_query(spec) {
            if let Some(documents) = self.resolve_cached(&keys) {
                trace!(query = %signature, "Query served from cache");
                return Ok(QueryResult {
                    signature,
                    documents,
                    from_cache: true,
                });
            }
            self.queries.remove(spec);
        }

        let epochs = self.queries.epochs();
        let fetched = self
            .with_timeout(|| format!("query {}", signature), self.store.fetch_query(spec))
            .await?;

        let mut keys = Vec::with_capacity(fetched.len());
        let mut documents = Vec::with_capacity(fetched.len());
        for document in fetched {
            let key = document.key.clone();
            if self.negative.contains_key(&key) {
                self.negative.invalidate(&key).await;
            }
            let value = self.apply_fetched(document);
            keys.push(key.clone());
            documents.push(DocumentSnapshot::new(key, value));
        }

        let cached = self.queries.put_query(spec, keys, [], None, epochs);
        debug!(query = %signature, results = documents.len(), cached, "Query fetched");
        Ok(QueryResult {
            signature,
            documents,
            from_cache: false,
        })
    }

    fn resolve_cached(&self, keys: &[EntityKey]) -> Option<Vec<DocumentSnapshot>> {
        let mut documents = Vec::with_capacity(keys.len());
        for key in keys {
            match self.entities.get(key) {
                Lookup::Hit(value) => documents.push(DocumentSnapshot::new(key.clone(), value)),
                Lookup::Expired => {
                    self.handle_dropped(std::slice::from_ref(key));
                    return None;
                }
                Lookup::Miss => return None,
            }
        }
        Some(documents)
    }

    /// Cache a fetched document unless a newer version was already applied
    fn apply_fetched(&self, document: StoredDocument) -> Arc<Value> {
        let StoredDocument {
            key,
            value,
            version,
        } = document;
        let value = Arc::new(value);

        let dropped = match self.applied.entry(key.clone()) {
            Entry::Occupied(mut applied) => {
                if applied.get().sequence > version {
                    trace!(key = %key, version, "Fetched data older than applied event, not caching");
                    return self.entities.peek(&key).unwrap_or(value);
                }
                applied.insert(AppliedVersion {
                    sequence: version,
                    live: true,
                    touched: Instant::now(),
                });
                self.entities.put(&key, Arc::clone(&value), None)
            }
            Entry::Vacant(slot) => {
                slot.insert(AppliedVersion {
                    sequence: version,
                    live: true,
                    touched: Instant::now(),
                });
                self.entities.put(&key, Arc::clone(&value), None)
            }
        };

        self.handle_dropped(&dropped);
        value
    }

    // ===================
    // Local writes
    // ===================

    /// Optimistic write
    ///
    /// Subscribers see the new value immediately. If the store rejects the
    /// write the cache is restored (when nothing newer replaced it) and
    /// subscribers are notified again; the error is returned either way.
    pub async fn write(&self, key: &EntityKey, value: Value) -> SyncResult<DocumentSnapshot> {
        let optimistic = Arc::new(value);

        let (previous, expected_version, dropped) = {
            let applied = self
                .applied
                .entry(key.clone())
                .or_insert_with(AppliedVersion::unseen);
            let previous = self.entities.peek(key);
            let dropped = self.entities.put(key, Arc::clone(&optimistic), None);
            (previous, applied.expected_version(), dropped)
        };

        if self.negative.contains_key(key) {
            self.negative.invalidate(key).await;
        }
        self.handle_dropped(&dropped);
        self.propagate(key, previous.as_deref(), Some(&optimistic));
        self.events.publish(SyncEvent::EntityUpdated(key.clone()));
        debug!(key = %key, expected_version, "Optimistic write applied");

        let outcome = self
            .with_timeout(
                || format!("write {}", key),
                self.store
                    .write_entity(key, (*optimistic).clone(), expected_version),
            )
            .await;

        match outcome {
            Ok(committed) => Ok(self.apply_committed(committed, &optimistic)),
            Err(err) => {
                self.rollback(key, &optimistic, previous, &err);
                if err.is_conflict() {
                    self.refresh_after_conflict(key).await;
                }
                Err(err)
            }
        }
    }

    fn apply_committed(&self, committed: StoredDocument, optimistic: &Arc<Value>) -> DocumentSnapshot {
        let key = committed.key.clone();

        let (value, previous, dropped) = {
            let mut applied = self
                .applied
                .entry(key.clone())
                .or_insert_with(AppliedVersion::unseen);

            if applied.sequence > committed.version {
                // a newer feed event already replaced our write
                let current = self
                    .entities
                    .peek(&key)
                    .unwrap_or_else(|| Arc::new(committed.value));
                return DocumentSnapshot::new(key, current);
            }
            *applied = AppliedVersion {
                sequence: committed.version,
                live: true,
                touched: Instant::now(),
            };

            let previous = self.entities.peek(&key);
            let still_ours = previous
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, optimistic));
            if still_ours && committed.value == **optimistic {
                return DocumentSnapshot::new(key, Arc::clone(optimistic));
            }
            // normalized by the store, or a concurrent write's value is cached;
            // the committed version wins either way
            let value = Arc::new(committed.value);
            let dropped = self.entities.put(&key, Arc::clone(&value), None);
            (value, previous, dropped)
        };

        self.handle_dropped(&dropped);
        self.propagate(&key, previous.as_deref(), Some(&value));
        self.events.publish(SyncEvent::EntityUpdated(key.clone()));
        DocumentSnapshot::new(key, value)
    }

    fn rollback(
        &self,
        key: &EntityKey,
        optimistic: &Arc<Value>,
        previous: Option<Arc<Value>>,
        cause: &SyncError,
    ) {
        let (rolled_back, dropped) = {
            let _applied = self
                .applied
                .entry(key.clone())
                .or_insert_with(AppliedVersion::unseen);
            let still_ours = self
                .entities
                .peek(key)
                .is_some_and(|current| Arc::ptr_eq(&current, optimistic));

            match (still_ours, &previous) {
                (false, _) => (false, Vec::new()),
                (true, Some(prior)) => (true, self.entities.put(key, Arc::clone(prior), None)),
                (true, None) => {
                    self.entities.invalidate(key);
                    (true, Vec::new())
                }
            }
        };

        if !rolled_back {
            debug!(key = %key, "Write failed but a newer value is cached, skipping rollback");
            return;
        }
        self.handle_dropped(&dropped);
        self.propagate(key, Some(optimistic), previous.as_deref());
        self.events.publish(SyncEvent::WriteRolledBack(key.clone()));
        warn!(key = %key, error = %cause, "Rolled back optimistic write");
    }

    /// Pull the authoritative state after a conflict so the caller can merge
    async fn refresh_after_conflict(&self, key: &EntityKey) {
        let fetched = self
            .with_timeout(|| format!("fetch {}", key), self.store.fetch_entity(key))
            .await;
        match fetched {
            Ok(Some(document)) => {
                self.apply_change(ChangeEvent::upsert(
                    document.key,
                    document.value,
                    document.version,
                ))
                .await;
            }
            Ok(None) => {
                let previous = self.entities.peek(key);
                if self.entities.invalidate(key) {
                    self.propagate(key, previous.as_deref(), None);
                    self.events.publish(SyncEvent::EntityInvalidated(key.clone()));
                }
            }
            Err(err) => debug!(key = %key, error = %err, "Refresh after conflict failed"),
        }
    }

    // ===================
    // Change feed
    // ===================

    /// Apply one upstream change. Returns false when the event was already
    /// superseded for its key.
    pub async fn apply_change(&self, event: ChangeEvent) -> bool {
        let ChangeEvent {
            key,
            change,
            sequence,
        } = event;
        let tombstone = matches!(change, Change::Tombstone);

        let (previous, current, dropped) = {
            let mut applied = self
                .applied
                .entry(key.clone())
                .or_insert_with(AppliedVersion::unseen);
            if sequence <= applied.sequence {
                trace!(key = %key, sequence, applied = applied.sequence, "Dropping superseded change");
                return false;
            }
            *applied = AppliedVersion {
                sequence,
                live: !tombstone,
                touched: Instant::now(),
            };

            let previous = self.entities.peek(&key);
            match change {
                Change::Upsert(value) => {
                    let value = Arc::new(value);
                    let dropped = self.entities.put(&key, Arc::clone(&value), None);
                    (previous, Some(value), dropped)
                }
                Change::Tombstone => {
                    self.entities.invalidate(&key);
                    (previous, None, Vec::new())
                }
            }
        };

        if tombstone {
            self.remember_missing(&key).await;
        } else if self.negative.contains_key(&key) {
            self.negative.invalidate(&key).await;
        }

        self.handle_dropped(&dropped);
        self.propagate(&key, previous.as_deref(), current.as_deref());
        self.events.publish(if tombstone {
            SyncEvent::EntityInvalidated(key.clone())
        } else {
            SyncEvent::EntityUpdated(key.clone())
        });
        trace!(key = %key, sequence, tombstone, "Applied change");
        true
    }

    /// Forget everything cached in a scope after a feed gap
    ///
    /// Missed events cannot be replayed, so every overlapping query and every
    /// cached entity matching the scope is dropped.
    pub fn invalidate_scope(&self, scope: &QuerySpec) {
        let queries = self
            .queries
            .invalidate_matching(scope.kind, |spec| spec.overlaps(scope));
        let entities = self
            .entities
            .invalidate_where(scope.kind, |value| scope.matches(value));

        self.events.publish_invalidated(queries.iter().cloned());
        self.handle_dropped(&entities);
        info!(
            scope = %scope,
            queries = queries.len(),
            entities = entities.len(),
            "Invalidated scope after feed gap"
        );
    }

    // ===================
    // Maintenance
    // ===================

    /// Drop expired entries from both caches and forget old sequences.
    /// Returns (expired entities, expired queries).
    pub fn sweep(&self) -> (usize, usize) {
        let expired = self.entities.evict_expired();
        self.handle_dropped(&expired);
        let expired_queries = self.queries.evict_expired().len();
        let pruned = self.prune_versions();

        self.events.publish(SyncEvent::SweepCompleted {
            expired_entities: expired.len(),
            expired_queries,
        });
        debug!(
            expired_entities = expired.len(),
            expired_queries,
            pruned_versions = pruned,
            "Cache sweep complete"
        );
        (expired.len(), expired_queries)
    }

    /// Forget sequences of keys that are no longer cached and have been
    /// quiet longer than any in-flight fetch can last
    fn prune_versions(&self) -> usize {
        let retention = self.config.version_retention();
        let before = self.applied.len();
        self.applied
            .retain(|key, version| version.touched.elapsed() < retention || self.entities.contains(key));
        before.saturating_sub(self.applied.len())
    }

    /// Drop every cached entity and query. Applied sequences are kept so
    /// refetches still respect per-key ordering.
    pub fn clear_caches(&self) {
        self.entities.clear();
        self.queries.clear();
        info!("Cleared entity and query caches");
    }

    /// Cached value without fetching or touching recency
    pub fn peek(&self, key: &EntityKey) -> Option<Arc<Value>> {
        self.entities.peek(key)
    }

    // ===================
    // Internals
    // ===================

    /// Invalidate queries and enqueue subscribers for a change of `key`
    fn propagate(&self, key: &EntityKey, old: Option<&Value>, new: Option<&Value>) {
        let kind = key.kind();
        let mut signatures = self.queries.invalidate_by_entity(key);
        signatures.extend(self.queries.invalidate_matching(kind, |spec| {
            affected(spec, kind, old, new)
        }));
        self.events.publish_invalidated(signatures);
        self.registry.enqueue(key, old, new);
    }

    /// Follow-up for keys that left the entity cache without changing
    /// (eviction, expiry, scope drops). Dependent queries go, epochs stay.
    fn handle_dropped(&self, keys: &[EntityKey]) {
        for key in keys {
            self.queries.drop_dependents(key);
            self.events.publish(SyncEvent::EntityInvalidated(key.clone()));
            debug!(key = %key, "Entity dropped from cache");
        }
    }

    async fn is_known_missing(&self, key: &EntityKey) -> bool {
        match self.negative.get(key).await {
            Some(expires_at) if Instant::now() < expires_at => true,
            Some(_) => {
                self.negative.invalidate(key).await;
                false
            }
            None => false,
        }
    }

    async fn remember_missing(&self, key: &EntityKey) {
        let expires_at = Instant::now() + self.config.negative_ttl();
        self.negative.insert(key.clone(), expires_at).await;
    }

    async fn with_timeout<T, F>(&self, operation: impl FnOnce() -> String, call: F) -> SyncResult<T>
    where
        F: Future<Output = SyncResult<T>>,
    {
        let timeout = self.config.fetch_timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                let operation = operation();
                warn!(operation = %operation, timeout_ms = self.config.fetch_timeout_ms, "Store call timed out");
                Err(SyncError::FetchTimeout {
                    operation,
                    timeout_ms: self.config.fetch_timeout_ms,
                })
            }
        }
    }
}

/// Whether a change from `old` to `new` can alter the result of `spec`.
/// Unknown values on both sides count as affecting every query of the kind.
fn affected(spec: &QuerySpec, kind: EntityKind, old: Option<&Value>, new: Option<&Value>) -> bool {
    match (old, new) {
        (None, None) => spec.kind == kind,
        _ => {
            old.is_some_and(|v| spec.could_contain(kind, v))
                || new.is_some_and(|v| spec.could_contain(kind, v))
        }
    }
}
