//! Cache health monitor
//!
//! Read-only: snapshots are assembled from counters the caches already keep,
//! only when asked. Recommendations come from a pure function of the
//! snapshot and are advisory.

use crate::config::HealthThresholds;
use crate::coordinator::InvalidationCoordinator;
use chrono::Utc;
use std::sync::Arc;
use teamboard_types::{HealthSnapshot, KindHealth, QueryHealth, Recommendation};

/// Assembles health snapshots on demand
pub struct HealthMonitor {
    coordinator: Arc<InvalidationCoordinator>,
    thresholds: HealthThresholds,
}

impl HealthMonitor {
    pub fn new(coordinator: Arc<InvalidationCoordinator>) -> Self {
        let thresholds = coordinator.config().health;
        Self {
            coordinator,
            thresholds,
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let kinds = self.coordinator.entities().health();
        let queries = self.coordinator.queries().health();
        let registry = self.coordinator.registry();
        build_snapshot(
            kinds,
            queries,
            registry.active_subscriptions(),
            registry.live_observers(),
            &self.thresholds,
        )
    }
}

/// Combine counters into a snapshot with aggregate rates and recommendations
pub fn build_snapshot(
    kinds: Vec<KindHealth>,
    queries: QueryHealth,
    active_subscriptions: usize,
    live_observers: usize,
    thresholds: &HealthThresholds,
) -> HealthSnapshot {
    let hits: u64 = kinds.iter().map(|k| k.hits).sum();
    let lookups: u64 = kinds.iter().map(|k| k.lookups()).sum();
    let evictions: u64 = kinds.iter().map(|k| k.evictions).sum();
    let inserts: u64 = kinds.iter().map(|k| k.inserts).sum();
    let approx_bytes = kinds.iter().map(|k| k.approx_bytes).sum::<u64>() + queries.approx_bytes;

    let mut snapshot = HealthSnapshot {
        generated_at: Utc::now(),
        kinds,
        queries,
        active_subscriptions,
        live_observers,
        hit_rate: ratio(hits, lookups),
        eviction_rate: ratio(evictions, inserts),
        approx_bytes,
        recommendations: Vec::new(),
    };
    snapshot.recommendations = recommend(&snapshot, thresholds);
    snapshot
}

/// Tuning hints for a snapshot
///
/// Rules, each only once a partition has `min_samples` lookups:
/// - hit rate below `min_hit_rate` and eviction rate above
///   `max_eviction_rate` → double capacity
/// - hit rate below `min_hit_rate` and more expirations than evictions
///   → double TTL
/// - utilization below `low_utilization` with no evictions → shrink
///   capacity to twice the current entry count
/// - query invalidations outnumbering query hits → report churn
pub fn recommend(snapshot: &HealthSnapshot, thresholds: &HealthThresholds) -> Vec<Recommendation> {
    let mut recommendations = Vec::new();

    for kind in &snapshot.kinds {
        if kind.lookups() < thresholds.min_samples {
            continue;
        }
        let low_hit_rate = kind.hit_rate() < thresholds.min_hit_rate;

        if low_hit_rate && kind.eviction_rate() > thresholds.max_eviction_rate {
            recommendations.push(Recommendation::IncreaseCapacity {
                kind: kind.kind,
                current: kind.capacity,
                suggested: kind.capacity.saturating_mul(2),
            });
        } else if low_hit_rate && kind.expirations > kind.evictions {
            recommendations.push(Recommendation::ExtendTtl {
                kind: kind.kind,
                current_ms: kind.ttl_ms,
                suggested_ms: kind.ttl_ms.saturating_mul(2),
            });
        } else if kind.evictions == 0 && kind.utilization() < thresholds.low_utilization {
            let suggested = (kind.entries * 2).max(16);
            if suggested < kind.capacity {
                recommendations.push(Recommendation::ReduceCapacity {
                    kind: kind.kind,
                    current: kind.capacity,
                    suggested,
                });
            }
        }
    }

    let queries = &snapshot.queries;
    if queries.hits + queries.misses >= thresholds.min_samples && queries.invalidations > queries.hits {
        recommendations.push(Recommendation::HighQueryChurn {
            invalidations: queries.invalidations,
            hits: queries.hits,
        });
    }

    recommendations
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teamboard_types::EntityKind;

    fn kind_health(kind: EntityKind) -> KindHealth {
        KindHealth {
            kind,
            entries: 0,
            capacity: 500,
            ttl_ms: 120_000,
            hits: 0,
            misses: 0,
            inserts: 0,
            evictions: 0,
            expirations: 0,
            approx_bytes: 0,
        }
    }

    fn snapshot_of(kinds: Vec<KindHealth>, queries: QueryHealth) -> HealthSnapshot {
        build_snapshot(kinds, queries, 0, 0, &HealthThresholds::default())
    }

    #[test]
    fn test_thrashing_partition_gets_capacity_hint() {
        let mut notifications = kind_health(EntityKind::Notification);
        notifications.entries = 500;
        notifications.hits = 20;
        notifications.misses = 180;
        notifications.inserts = 180;
        notifications.evictions = 150;

        let snapshot = snapshot_of(vec![notifications], QueryHealth::default());
        assert_eq!(
            snapshot.recommendations,
            vec![Recommendation::IncreaseCapacity {
                kind: EntityKind::Notification,
                current: 500,
                suggested: 1000,
            }]
        );
        assert!((snapshot.hit_rate - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_expiring_partition_gets_ttl_hint() {
        let mut meetings = kind_health(EntityKind::Meeting);
        meetings.entries = 300;
        meetings.hits = 10;
        meetings.misses = 190;
        meetings.inserts = 190;
        meetings.expirations = 120;

        let recs = recommend(&snapshot_of(vec![meetings], QueryHealth::default()), &HealthThresholds::default());
        assert!(matches!(
            recs.as_slice(),
            [Recommendation::ExtendTtl { suggested_ms: 240_000, .. }]
        ));
    }

    #[test]
    fn test_oversized_partition_gets_shrink_hint() {
        let mut teams = kind_health(EntityKind::Team);
        teams.entries = 10;
        teams.hits = 300;
        teams.misses = 10;
        teams.inserts = 10;

        let recs = recommend(&snapshot_of(vec![teams], QueryHealth::default()), &HealthThresholds::default());
        assert!(matches!(
            recs.as_slice(),
            [Recommendation::ReduceCapacity { suggested: 20, .. }]
        ));
    }

    #[test]
    fn test_no_hints_below_sample_floor() {
        let mut notifications = kind_health(EntityKind::Notification);
        notifications.misses = 50;
        notifications.inserts = 50;
        notifications.evictions = 50;

        let snapshot = snapshot_of(vec![notifications], QueryHealth::default());
        assert!(snapshot.recommendations.is_empty());
    }

    #[test]
    fn test_query_churn_and_byte_totals() {
        let mut team = kind_health(EntityKind::Team);
        team.approx_bytes = 400;
        let queries = QueryHealth {
            entries: 3,
            hits: 40,
            misses: 80,
            invalidations: 90,
            evictions: 0,
            approx_bytes: 100,
        };

        let snapshot = snapshot_of(vec![team], queries);
        assert_eq!(snapshot.approx_bytes, 500);
        assert_eq!(
            snapshot.recommendations,
            vec![Recommendation::HighQueryChurn {
                invalidations: 90,
                hits: 40,
            }]
        );
    }
}
