//! Per-kind bounded entity cache with TTL + LRU eviction
//!
//! One partition per [`EntityKind`], each behind its own lock, so traffic on
//! notifications never contends with traffic on team rosters.
//!
//! Rules:
//! - an entry past `expires_at` is never returned; it is dropped on access
//! - expired entries are purged before any live entry is evicted for room
//! - overwriting a key resets its timestamps but keeps its recency slot
//! - values are `Arc` snapshots; callers clone out, never borrow in

use crate::config::{EntityPolicies, EntityPolicy};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use teamboard_types::{EntityKey, EntityKind, KindHealth};
use tokio::time::Instant;
use tracing::trace;

/// Smallest TTL accepted by `put`; keeps `expires_at > inserted_at`
const MIN_TTL: Duration = Duration::from_millis(1);

/// Outcome of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(Arc<Value>),
    Miss,
    /// Entry existed but had expired; it has been removed
    Expired,
}

impl Lookup {
    pub fn into_value(self) -> Option<Arc<Value>> {
        match self {
            Lookup::Hit(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }
}

#[derive(Debug)]
struct CacheEntry {
    value: Arc<Value>,
    inserted_at: Instant,
    expires_at: Instant,
    last_accessed_at: Instant,
    size_bytes: usize,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

struct Partition {
    entries: LruCache<String, CacheEntry>,
    bytes: usize,
}

impl Partition {
    fn remove(&mut self, id: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(id)?;
        self.bytes = self.bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn expired_ids(&self, now: Instant) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[derive(Default)]
struct PartitionStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

struct Shard {
    kind: EntityKind,
    policy: EntityPolicy,
    partition: Mutex<Partition>,
    stats: PartitionStats,
}

/// Entity cache partitioned by kind
///
/// Mutators are crate-private: only the coordinator writes.
pub struct EntityCache {
    shards: Vec<Shard>,
}

impl EntityCache {
    pub fn new(policies: &EntityPolicies) -> Self {
        let shards = EntityKind::ALL
            .iter()
            .map(|&kind| Shard {
                kind,
                policy: *policies.get(kind),
                partition: Mutex::new(Partition {
                    entries: LruCache::unbounded(),
                    bytes: 0,
                }),
                stats: PartitionStats::default(),
            })
            .collect();
        Self { shards }
    }

    fn shard(&self, kind: EntityKind) -> &Shard {
        let index = match kind {
            EntityKind::Meeting => 0,
            EntityKind::Team => 1,
            EntityKind::Notification => 2,
            EntityKind::UserProfile => 3,
        };
        &self.shards[index]
    }

    pub fn policy(&self, kind: EntityKind) -> EntityPolicy {
        self.shard(kind).policy
    }

    /// Look up an entity, promoting it to most-recently-used on a hit
    pub fn get(&self, key: &EntityKey) -> Lookup {
        let shard = self.shard(key.kind());
        let now = Instant::now();
        let mut partition = shard.partition.lock();

        match partition.entries.get_mut(key.id()) {
            None => {
                shard.stats.misses.fetch_add(1, Ordering::Relaxed);
                return Lookup::Miss;
            }
            Some(entry) if !entry.is_expired(now) => {
                entry.last_accessed_at = now;
                shard.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Lookup::Hit(Arc::clone(&entry.value));
            }
            Some(_) => {}
        }

        partition.remove(key.id());
        shard.stats.misses.fetch_add(1, Ordering::Relaxed);
        shard.stats.expirations.fetch_add(1, Ordering::Relaxed);
        trace!(key = %key, "Expired on access");
        Lookup::Expired
    }

    /// Current unexpired value without touching recency or stats
    pub fn peek(&self, key: &EntityKey) -> Option<Arc<Value>> {
        let partition = self.shard(key.kind()).partition.lock();
        partition
            .entries
            .peek(key.id())
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| Arc::clone(&entry.value))
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.peek(key).is_some()
    }

    /// Entries held for a kind, expired ones included until swept
    pub fn len(&self, kind: EntityKind) -> usize {
        self.shard(kind).partition.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        EntityKind::ALL.iter().all(|&kind| self.len(kind) == 0)
    }

    /// Insert or overwrite an entry
    ///
    /// `ttl` of `None` uses the kind's policy. Returns the keys dropped to
    /// make room (expired first, then least recently used).
    pub(crate) fn put(
        &self,
        key: &EntityKey,
        value: Arc<Value>,
        ttl: Option<Duration>,
    ) -> Vec<EntityKey> {
        let shard = self.shard(key.kind());
        let ttl = ttl.unwrap_or_else(|| shard.policy.ttl()).max(MIN_TTL);
        let size_bytes = approx_size(key, &value);
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            inserted_at: now,
            expires_at: now + ttl,
            last_accessed_at: now,
            size_bytes,
        };

        let mut guard = shard.partition.lock();
        let partition = &mut *guard;
        shard.stats.inserts.fetch_add(1, Ordering::Relaxed);

        if let Some(existing) = partition.entries.peek_mut(key.id()) {
            let previous_size = existing.size_bytes;
            *existing = entry;
            partition.bytes = partition.bytes.saturating_sub(previous_size) + size_bytes;
            return Vec::new();
        }

        let mut dropped = Vec::new();
        if partition.entries.len() >= shard.policy.capacity {
            for id in partition.expired_ids(now) {
                partition.remove(&id);
                shard.stats.expirations.fetch_add(1, Ordering::Relaxed);
                dropped.push(EntityKey::new(shard.kind, id));
            }
        }
        while partition.entries.len() >= shard.policy.capacity {
            let Some((id, evicted)) = partition.entries.pop_lru() else {
                break;
            };
            partition.bytes = partition.bytes.saturating_sub(evicted.size_bytes);
            shard.stats.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(kind = %shard.kind, id = %id, "Evicted least recently used");
            dropped.push(EntityKey::new(shard.kind, id));
        }

        partition.entries.put(key.id().to_string(), entry);
        partition.bytes += size_bytes;
        dropped
    }

    /// Remove one entry. Returns whether it was present.
    pub(crate) fn invalidate(&self, key: &EntityKey) -> bool {
        self.shard(key.kind())
            .partition
            .lock()
            .remove(key.id())
            .is_some()
    }

    /// Remove every entry of `kind` whose value satisfies `predicate`
    pub(crate) fn invalidate_where<F>(&self, kind: EntityKind, predicate: F) -> Vec<EntityKey>
    where
        F: Fn(&Value) -> bool,
    {
        let mut partition = self.shard(kind).partition.lock();
        let ids: Vec<String> = partition
            .entries
            .iter()
            .filter(|(_, entry)| predicate(&entry.value))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &ids {
            partition.remove(id);
        }
        ids.into_iter().map(|id| EntityKey::new(kind, id)).collect()
    }

    /// Drop every expired entry across all kinds
    pub(crate) fn evict_expired(&self) -> Vec<EntityKey> {
        let now = Instant::now();
        let mut removed = Vec::new();

        for shard in &self.shards {
            let mut partition = shard.partition.lock();
            for id in partition.expired_ids(now) {
                partition.remove(&id);
                shard.stats.expirations.fetch_add(1, Ordering::Relaxed);
                removed.push(EntityKey::new(shard.kind, id));
            }
        }
        removed
    }

    pub(crate) fn clear(&self) {
        for shard in &self.shards {
            let mut partition = shard.partition.lock();
            partition.entries.clear();
            partition.bytes = 0;
        }
    }

    /// Age of an entry since it was last written
    pub fn age(&self, key: &EntityKey) -> Option<Duration> {
        let partition = self.shard(key.kind()).partition.lock();
        partition
            .entries
            .peek(key.id())
            .map(|entry| entry.inserted_at.elapsed())
    }

    /// Time since an entry was last served
    pub fn idle_time(&self, key: &EntityKey) -> Option<Duration> {
        let partition = self.shard(key.kind()).partition.lock();
        partition
            .entries
            .peek(key.id())
            .map(|entry| entry.last_accessed_at.elapsed())
    }

    pub fn kind_health(&self, kind: EntityKind) -> KindHealth {
        let shard = self.shard(kind);
        let (entries, bytes) = {
            let partition = shard.partition.lock();
            (partition.entries.len(), partition.bytes)
        };
        KindHealth {
            kind,
            entries,
            capacity: shard.policy.capacity,
            ttl_ms: shard.policy.ttl_ms,
            hits: shard.stats.hits.load(Ordering::Relaxed),
            misses: shard.stats.misses.load(Ordering::Relaxed),
            inserts: shard.stats.inserts.load(Ordering::Relaxed),
            evictions: shard.stats.evictions.load(Ordering::Relaxed),
            expirations: shard.stats.expirations.load(Ordering::Relaxed),
            approx_bytes: bytes as u64,
        }
    }

    pub fn health(&self) -> Vec<KindHealth> {
        EntityKind::ALL
            .iter()
            .map(|&kind| self.kind_health(kind))
            .collect()
    }
}

/// Serialized size of a value plus its key
pub(crate) fn approx_size(key: &EntityKey, value: &Value) -> usize {
    let body = serde_json::to_vec(value).map(|bytes| bytes.len()).unwrap_or(0);
    body + key.id().len()
}
