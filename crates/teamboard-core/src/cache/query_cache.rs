//! Query result cache: ordered key lists tagged with their dependencies
//!
//! Cached orderings are never patched. Any write to an entity in
//! `depends_on`, or any write that could move an entity into or out of the
//! query's filter, drops the whole entry; the next read refetches.
//!
//! A reverse index `entity -> signatures` makes `invalidate_by_entity`
//! proportional to the number of affected queries.
//!
//! Each kind partition also carries an invalidation epoch. A reader takes an
//! [`EpochStamp`] before fetching and `put_query` refuses to cache if the
//! query's kind, or the kind of any extra dependency, was invalidated in
//! between, so a slow fetch cannot resurrect an ordering that was already
//! invalidated. Entities that merely leave the entity cache (eviction,
//! expiry) drop their dependents without moving any epoch.

use crate::config::QueryPolicy;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use teamboard_types::{EntityKey, EntityKind, QueryHealth, QuerySpec};
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug)]
struct QueryCacheEntry {
    spec: QuerySpec,
    result_keys: Vec<EntityKey>,
    depends_on: HashSet<EntityKey>,
    expires_at: Instant,
    size_bytes: usize,
}

struct QueryPartition {
    entries: LruCache<String, QueryCacheEntry>,
    dependents: HashMap<EntityKey, HashSet<String>>,
    epoch: u64,
    bytes: usize,
}

impl QueryPartition {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            dependents: HashMap::new(),
            epoch: 0,
            bytes: 0,
        }
    }

    fn remove(&mut self, signature: &str) -> Option<QueryCacheEntry> {
        let entry = self.entries.pop(signature)?;
        self.bytes = self.bytes.saturating_sub(entry.size_bytes);
        for key in &entry.depends_on {
            if let Some(signatures) = self.dependents.get_mut(key) {
                signatures.remove(signature);
                if signatures.is_empty() {
                    self.dependents.remove(key);
                }
            }
        }
        Some(entry)
    }

    fn signatures_where<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&QueryCacheEntry) -> bool,
    {
        self.entries
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(signature, _)| signature.clone())
            .collect()
    }
}

#[derive(Default)]
struct QueryStats {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
}

fn kind_index(kind: EntityKind) -> usize {
    match kind {
        EntityKind::Meeting => 0,
        EntityKind::Team => 1,
        EntityKind::Notification => 2,
        EntityKind::UserProfile => 3,
    }
}

/// Invalidation epochs of every kind, taken before a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochStamp([u64; EntityKind::ALL.len()]);

impl EpochStamp {
    pub fn of(&self, kind: EntityKind) -> u64 {
        self.0[kind_index(kind)]
    }
}

/// Ordered query results keyed by query signature
pub struct QueryCache {
    policy: QueryPolicy,
    partitions: Vec<Mutex<QueryPartition>>,
    stats: QueryStats,
}

impl QueryCache {
    pub fn new(policy: QueryPolicy) -> Self {
        Self {
            policy,
            partitions: EntityKind::ALL
                .iter()
                .map(|_| Mutex::new(QueryPartition::new()))
                .collect(),
            stats: QueryStats::default(),
        }
    }

    fn partition(&self, kind: EntityKind) -> &Mutex<QueryPartition> {
        &self.partitions[kind_index(kind)]
    }

    /// Cached ordering for a query, if present and unexpired
    pub fn get_query(&self, spec: &QuerySpec) -> Option<Vec<EntityKey>> {
        let signature = spec.signature();
        let now = Instant::now();
        let mut partition = self.partition(spec.kind).lock();

        let expired = match partition.entries.get(&signature) {
            Some(entry) if now < entry.expires_at => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.result_keys.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            partition.remove(&signature);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn epoch(&self, kind: EntityKind) -> u64 {
        self.partition(kind).lock().epoch
    }

    /// Epochs of every kind; pass the stamp back to `put_query`
    pub fn epochs(&self) -> EpochStamp {
        let mut stamp = [0; EntityKind::ALL.len()];
        for (slot, partition) in stamp.iter_mut().zip(&self.partitions) {
            *slot = partition.lock().epoch;
        }
        EpochStamp(stamp)
    }

    /// Cache an ordering
    ///
    /// `depends_on` is merged with `result_keys`. Returns `false` (and caches
    /// nothing) when the query's kind, or the kind of any dependency, was
    /// invalidated since `observed` was taken.
    pub(crate) fn put_query(
        &self,
        spec: &QuerySpec,
        result_keys: Vec<EntityKey>,
        depends_on: impl IntoIterator<Item = EntityKey>,
        ttl: Option<Duration>,
        observed: EpochStamp,
    ) -> bool {
        let signature = spec.signature();
        let mut depends_on: HashSet<EntityKey> = depends_on.into_iter().collect();
        depends_on.extend(result_keys.iter().cloned());
        let foreign_kinds: HashSet<EntityKind> = depends_on
            .iter()
            .map(EntityKey::kind)
            .filter(|kind| *kind != spec.kind)
            .collect();
        let size_bytes = signature.len()
            + result_keys
                .iter()
                .map(|key| key.id().len() + 8)
                .sum::<usize>();
        let now = Instant::now();
        let ttl = ttl.unwrap_or_else(|| self.policy.ttl());

        let mut partition = self.partition(spec.kind).lock();
        if partition.epoch != observed.of(spec.kind) {
            trace!(query = %signature, "Skipping cache fill, invalidated during fetch");
            return false;
        }

        partition.remove(&signature);
        if partition.entries.len() >= self.policy.capacity {
            for expired in partition.signatures_where(|entry| now >= entry.expires_at) {
                partition.remove(&expired);
            }
        }
        while partition.entries.len() >= self.policy.capacity {
            let Some(evicted) = partition.entries.peek_lru().map(|(s, _)| s.clone()) else {
                break;
            };
            partition.remove(&evicted);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(query = %evicted, "Evicted least recently used query");
        }

        for key in &depends_on {
            partition
                .dependents
                .entry(key.clone())
                .or_default()
                .insert(signature.clone());
        }
        partition.bytes += size_bytes;
        partition.entries.put(
            signature.clone(),
            QueryCacheEntry {
                spec: spec.clone(),
                result_keys,
                depends_on,
                expires_at: now + ttl,
                size_bytes,
            },
        );
        drop(partition);

        // Other kinds are checked after the insert, never under a second lock.
        // `invalidate_by_entity` bumps before it scans, so a concurrent
        // invalidation either shows up here or finds the new entry.
        let stale = foreign_kinds
            .iter()
            .any(|kind| self.epoch(*kind) != observed.of(*kind));
        if stale {
            self.partition(spec.kind).lock().remove(&signature);
            trace!(query = %signature, "Dropping cache fill, a dependency was invalidated during fetch");
            return false;
        }
        true
    }

    /// Drop every query depending on `key` and advance the epoch of `key`'s
    /// kind, so fetches already in flight are not cached either
    pub(crate) fn invalidate_by_entity(&self, key: &EntityKey) -> Vec<String> {
        self.partition(key.kind()).lock().epoch += 1;
        self.drop_dependents(key)
    }

    /// Drop every query depending on `key` without touching any epoch
    ///
    /// For entities that left the entity cache unchanged. Queries may depend
    /// on keys of another kind, so every partition's index is consulted.
    pub(crate) fn drop_dependents(&self, key: &EntityKey) -> Vec<String> {
        let mut signatures = Vec::new();
        for partition in &self.partitions {
            let mut partition = partition.lock();
            let dependents: Vec<String> = partition
                .dependents
                .get(key)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();
            for signature in dependents {
                partition.remove(&signature);
                signatures.push(signature);
            }
        }
        self.record_invalidations(&signatures);
        signatures
    }

    /// Drop every query of `kind` whose spec satisfies `predicate`.
    /// Always advances the kind's epoch.
    pub(crate) fn invalidate_matching<F>(&self, kind: EntityKind, predicate: F) -> Vec<String>
    where
        F: Fn(&QuerySpec) -> bool,
    {
        let mut partition = self.partition(kind).lock();
        partition.epoch += 1;

        let signatures = partition.signatures_where(|entry| predicate(&entry.spec));
        for signature in &signatures {
            partition.remove(signature);
        }
        self.record_invalidations(&signatures);
        signatures
    }

    /// Drop one query without touching the epoch
    pub(crate) fn remove(&self, spec: &QuerySpec) -> bool {
        self.partition(spec.kind)
            .lock()
            .remove(&spec.signature())
            .is_some()
    }

    pub(crate) fn evict_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let mut removed = Vec::new();
        for partition in &self.partitions {
            let mut partition = partition.lock();
            for signature in partition.signatures_where(|entry| now >= entry.expires_at) {
                partition.remove(&signature);
                removed.push(signature);
            }
        }
        removed
    }

    pub(crate) fn clear(&self) {
        for partition in &self.partitions {
            let mut partition = partition.lock();
            partition.entries.clear();
            partition.dependents.clear();
            partition.bytes = 0;
            partition.epoch += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| p.lock().entries.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signatures currently depending on an entity
    pub fn dependents_of(&self, key: &EntityKey) -> Vec<String> {
        let mut signatures: Vec<String> = self
            .partitions
            .iter()
            .flat_map(|p| {
                p.lock()
                    .dependents
                    .get(key)
                    .map(|set| set.iter().cloned().collect::<Vec<_>>())
                    .unwrap_or_default()
            })
            .collect();
        signatures.sort();
        signatures
    }

    pub fn health(&self) -> QueryHealth {
        let (entries, bytes) = self.partitions.iter().fold((0, 0), |(n, b), p| {
            let p = p.lock();
            (n + p.entries.len(), b + p.bytes)
        });
        QueryHealth {
            entries,
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            approx_bytes: bytes as u64,
        }
    }

    fn record_invalidations(&self, signatures: &[String]) {
        if signatures.is_empty() {
            return;
        }
        self.stats
            .invalidations
            .fetch_add(signatures.len() as u64, Ordering::Relaxed);
        debug!(count = signatures.len(), "Invalidated cached queries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meeting(id: &str) -> EntityKey {
        EntityKey::new(EntityKind::Meeting, id)
    }

    fn team_meetings(team: &str) -> QuerySpec {
        QuerySpec::new(EntityKind::Meeting)
            .filter("teamId", team)
            .order_by("createdAt")
    }

    fn cache() -> QueryCache {
        QueryCache::new(QueryPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_and_get_preserves_order() {
        let cache = cache();
        let spec = team_meetings("T1");
        let keys = vec![meeting("m2"), meeting("m1")];

        assert!(cache.put_query(&spec, keys.clone(), [], None, cache.epochs()));
        assert_eq!(cache.get_query(&spec), Some(keys));
        assert_eq!(cache.health().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_by_entity_drops_dependents_only() {
        let cache = cache();
        let t1 = team_meetings("T1");
        let t2 = team_meetings("T2");
        let epoch = cache.epochs();

        cache.put_query(&t1, vec![meeting("m1"), meeting("m2")], [], None, epoch);
        cache.put_query(&t2, vec![meeting("m3")], [], None, epoch);

        let dropped = cache.invalidate_by_entity(&meeting("m1"));
        assert_eq!(dropped, vec![t1.signature()]);
        assert_eq!(cache.get_query(&t1), None);
        assert!(cache.get_query(&t2).is_some());
        assert!(cache.dependents_of(&meeting("m2")).is_empty());
        assert_eq!(cache.dependents_of(&meeting("m3")), vec![t2.signature()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extra_dependencies_are_tracked() {
        let cache = cache();
        let spec = team_meetings("T1");
        let team = EntityKey::new(EntityKind::Team, "T1");
        cache.put_query(&spec, vec![meeting("m1")], [team.clone()], None, cache.epochs());

        assert_eq!(cache.dependents_of(&team), vec![spec.signature()]);
        assert_eq!(cache.invalidate_by_entity(&team), vec![spec.signature()]);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cross_kind_invalidation_during_fetch_is_not_cached() {
        let cache = cache();
        let spec = team_meetings("T1");
        let team = EntityKey::new(EntityKind::Team, "T1");
        let observed = cache.epochs();

        // the team changes while the meeting query is in flight
        cache.invalidate_by_entity(&team);
        assert_eq!(cache.epochs().of(EntityKind::Meeting), observed.of(EntityKind::Meeting));
        assert_ne!(cache.epochs().of(EntityKind::Team), observed.of(EntityKind::Team));
        assert!(!cache.put_query(&spec, vec![meeting("m1")], [team.clone()], None, observed));
        assert_eq!(cache.get_query(&spec), None);
        assert!(cache.dependents_of(&team).is_empty());

        // a fill without the team dependency is unaffected
        assert!(cache.put_query(&spec, vec![meeting("m1")], [], None, observed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_dependents_keeps_epochs() {
        let cache = cache();
        let t1 = team_meetings("T1");
        let t2 = team_meetings("T2");
        cache.put_query(&t1, vec![meeting("m1")], [], None, cache.epochs());
        let observed = cache.epochs();

        assert_eq!(cache.drop_dependents(&meeting("m1")), vec![t1.signature()]);
        assert_eq!(cache.epochs(), observed);
        assert_eq!(cache.get_query(&t1), None);
        // a fetch that started before the drop can still be cached
        assert!(cache.put_query(&t2, vec![meeting("m2")], [], None, observed));
        assert!(cache.get_query(&t2).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_epoch_is_not_cached() {
        let cache = cache();
        let spec = team_meetings("T1");
        let observed = cache.epochs();

        cache.invalidate_by_entity(&meeting("unrelated"));
        assert!(!cache.put_query(&spec, vec![meeting("m1")], [], None, observed));
        assert_eq!(cache.get_query(&spec), None);

        // other kinds are unaffected
        let teams = QuerySpec::new(EntityKind::Team);
        assert!(cache.put_query(&teams, vec![], [], None, cache.epochs()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_matching_scope() {
        let cache = cache();
        let epoch = cache.epochs();
        cache.put_query(&team_meetings("T1"), vec![], [], None, epoch);
        cache.put_query(&team_meetings("T2"), vec![], [], None, epoch);

        let scope = QuerySpec::new(EntityKind::Meeting).filter("teamId", "T1");
        let dropped = cache.invalidate_matching(EntityKind::Meeting, |spec| spec.overlaps(&scope));
        assert_eq!(dropped.len(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.health().invalidations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_and_capacity() {
        let cache = QueryCache::new(QueryPolicy {
            capacity: 2,
            ttl_ms: 1_000,
        });
        let epoch = cache.epochs();
        let (a, b, c) = (team_meetings("A"), team_meetings("B"), team_meetings("C"));

        cache.put_query(&a, vec![meeting("m1")], [], None, epoch);
        cache.put_query(&b, vec![], [], None, epoch);
        cache.put_query(&c, vec![], [], None, epoch);
        assert_eq!(cache.get_query(&a), None);
        assert_eq!(cache.health().evictions, 1);
        assert!(cache.dependents_of(&meeting("m1")).is_empty());

        tokio::time::advance(Duration::from_millis(1_100)).await;
        assert_eq!(cache.get_query(&b), None);
        assert_eq!(cache.evict_expired(), vec![c.signature()]);
        assert!(cache.is_empty());
    }
}
