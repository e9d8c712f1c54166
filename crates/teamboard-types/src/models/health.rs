//! Cache health snapshot types
//!
//! Plain data produced on demand by the health monitor. Rates are derived
//! from counters so a snapshot can be serialized and shipped as-is.

use super::entity::EntityKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Counters for one entity-kind partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindHealth {
    pub kind: EntityKind,
    pub entries: usize,
    pub capacity: usize,
    pub ttl_ms: u64,
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    /// Capacity (LRU) evictions
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed
    pub expirations: u64,
    /// Sum of serialized entry sizes
    pub approx_bytes: u64,
}

impl KindHealth {
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        ratio(self.hits, self.lookups())
    }

    /// Capacity evictions per insert
    pub fn eviction_rate(&self) -> f64 {
        ratio(self.evictions, self.inserts)
    }

    pub fn utilization(&self) -> f64 {
        ratio(self.entries as u64, self.capacity as u64)
    }
}

/// Counters for the query result cache (all kinds)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryHealth {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub evictions: u64,
    pub approx_bytes: u64,
}

impl QueryHealth {
    pub fn hit_rate(&self) -> f64 {
        ratio(self.hits, self.hits + self.misses)
    }
}

/// Advisory tuning hint; never acted on automatically
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Recommendation {
    /// Low hit rate with heavy LRU churn
    IncreaseCapacity {
        kind: EntityKind,
        current: usize,
        suggested: usize,
    },
    /// Low hit rate where entries mostly expire before reuse
    ExtendTtl {
        kind: EntityKind,
        current_ms: u64,
        suggested_ms: u64,
    },
    /// Partition far below its bound
    ReduceCapacity {
        kind: EntityKind,
        current: usize,
        suggested: usize,
    },
    /// Cached query orderings are invalidated more often than they are served
    HighQueryChurn { invalidations: u64, hits: u64 },
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Recommendation::IncreaseCapacity {
                kind,
                current,
                suggested,
            } => write!(
                f,
                "increase {} cache capacity from {} to {}",
                kind, current, suggested
            ),
            Recommendation::ExtendTtl {
                kind,
                current_ms,
                suggested_ms,
            } => write!(
                f,
                "extend {} TTL from {}ms to {}ms",
                kind, current_ms, suggested_ms
            ),
            Recommendation::ReduceCapacity {
                kind,
                current,
                suggested,
            } => write!(
                f,
                "reduce {} cache capacity from {} to {}",
                kind, current, suggested
            ),
            Recommendation::HighQueryChurn {
                invalidations,
                hits,
            } => write!(
                f,
                "query cache churn is high ({} invalidations vs {} hits)",
                invalidations, hits
            ),
        }
    }
}

/// Point-in-time view of the whole sync layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub generated_at: DateTime<Utc>,
    pub kinds: Vec<KindHealth>,
    pub queries: QueryHealth,
    pub active_subscriptions: usize,
    pub live_observers: usize,
    pub hit_rate: f64,
    pub eviction_rate: f64,
    pub approx_bytes: u64,
    pub recommendations: Vec<Recommendation>,
}

impl HealthSnapshot {
    pub fn kind(&self, kind: EntityKind) -> Option<&KindHealth> {
        self.kinds.iter().find(|k| k.kind == kind)
    }
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

    fn sample() -> KindHealth {
        KindHealth {
            kind: EntityKind::Team,
            entries: 5,
            capacity: 20,
            ttl_ms: 900_000,
            hits: 30,
            misses: 10,
            inserts: 10,
            evictions: 2,
            expirations: 0,
            approx_bytes: 512,
        }
    }

    #[test]
    fn test_kind_rates() {
        let k = sample();
        assert_eq!(k.lookups(), 40);
        assert!((k.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert!((k.eviction_rate() - 0.2).abs() < f64::EPSILON);
        assert!((k.utilization() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rates_with_no_traffic_are_zero() {
        let mut k = sample();
        k.hits = 0;
        k.misses = 0;
        k.inserts = 0;
        assert_eq!(k.hit_rate(), 0.0);
        assert_eq!(k.eviction_rate(), 0.0);
    }

    #[test]
    fn test_recommendation_display() {
        let rec = Recommendation::IncreaseCapacity {
            kind: EntityKind::Notification,
            current: 500,
            suggested: 1000,
        };
        assert_eq!(
            rec.to_string(),
            "increase notification cache capacity from 500 to 1000"
        );
    }
}
