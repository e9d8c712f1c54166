//! Configuration for the sync layer
//!
//! Loaded from TOML or built in code. Every field has a default, so a partial
//! file only overrides what it names:
//!
//! ```toml
//! batch_window_ms = 150
//!
//! [entities.notification]
//! capacity = 2000
//! ttl_ms = 120000
//! ```

use crate::error::{SyncError, SyncResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use teamboard_types::EntityKind;

/// Capacity bound and TTL for one entity-kind partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityPolicy {
    pub capacity: usize,
    pub ttl_ms: u64,
}

impl EntityPolicy {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl_ms: ttl.as_millis() as u64,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Per-kind policies
///
/// High-churn kinds (notifications) get short TTLs, rosters and profiles long ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityPolicies {
    pub meeting: EntityPolicy,
    pub team: EntityPolicy,
    pub notification: EntityPolicy,
    pub user_profile: EntityPolicy,
}

impl Default for EntityPolicies {
    fn default() -> Self {
        Self {
            meeting: EntityPolicy::new(1_000, Duration::from_secs(5 * 60)),
            team: EntityPolicy::new(200, Duration::from_secs(15 * 60)),
            notification: EntityPolicy::new(500, Duration::from_secs(2 * 60)),
            user_profile: EntityPolicy::new(1_000, Duration::from_secs(15 * 60)),
        }
    }
}

impl EntityPolicies {
    pub fn get(&self, kind: EntityKind) -> &EntityPolicy {
        match kind {
            EntityKind::Meeting => &self.meeting,
            EntityKind::Team => &self.team,
            EntityKind::Notification => &self.notification,
            EntityKind::UserProfile => &self.user_profile,
        }
    }

    pub fn get_mut(&mut self, kind: EntityKind) -> &mut EntityPolicy {
        match kind {
            EntityKind::Meeting => &mut self.meeting,
            EntityKind::Team => &mut self.team,
            EntityKind::Notification => &mut self.notification,
            EntityKind::UserProfile => &mut self.user_profile,
        }
    }
}

/// Bound and TTL for cached query orderings (applied per kind)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryPolicy {
    pub capacity: usize,
    pub ttl_ms: u64,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl_ms: 60_000,
        }
    }
}

impl QueryPolicy {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Exponential backoff for change-feed resubscription
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            max_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay before reconnect attempt `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(32) as i32);
        let millis = (self.initial_ms as f64 * factor).min(self.max_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Thresholds feeding the advisory recommendation policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// Hit rate below which a partition is considered under-performing
    pub min_hit_rate: f64,
    /// Evictions per insert above which capacity is considered too small
    pub max_eviction_rate: f64,
    /// Lookups required before any recommendation is made
    pub min_samples: u64,
    /// Utilization below which capacity is considered oversized
    pub low_utilization: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_hit_rate: 0.6,
            max_eviction_rate: 0.3,
            min_samples: 100,
            low_utilization: 0.1,
        }
    }
}

/// Full sync-layer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub entities: EntityPolicies,
    pub queries: QueryPolicy,
    /// Lifetime of cached NotFound results
    pub negative_ttl_ms: u64,
    /// Coalescing window for live-subscription dispatch
    pub batch_window_ms: u64,
    /// Upper bound for any single store call
    pub fetch_timeout_ms: u64,
    /// Period of the expired-entry sweep
    pub sweep_interval_ms: u64,
    pub feed_backoff: BackoffConfig,
    pub health: HealthThresholds,
    /// Capacity of the diagnostics broadcast channel
    pub event_capacity: usize,
    /// How long an applied feed sequence is remembered for an uncached key
    pub version_retention_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            entities: EntityPolicies::default(),
            queries: QueryPolicy::default(),
            negative_ttl_ms: 30_000,
            batch_window_ms: 120,
            fetch_timeout_ms: 5_000,
            sweep_interval_ms: 30_000,
            feed_backoff: BackoffConfig::default(),
            health: HealthThresholds::default(),
            event_capacity: 256,
            version_retention_ms: 600_000,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a TOML file, falling back to defaults for missing fields
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read sync config: {}", path.display()))?;
        let config: SyncConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse sync config: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid sync config: {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize sync config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write sync config to {}", path.display()))
    }

    pub fn validate(&self) -> SyncResult<()> {
        for kind in EntityKind::ALL {
            let policy = self.entities.get(kind);
            if policy.capacity == 0 {
                return Err(SyncError::invalid_config(format!(
                    "{} capacity must be > 0",
                    kind
                )));
            }
            if policy.ttl_ms == 0 {
                return Err(SyncError::invalid_config(format!("{} ttl must be > 0", kind)));
            }
        }
        if self.queries.capacity == 0 || self.queries.ttl_ms == 0 {
            return Err(SyncError::invalid_config(
                "query capacity and ttl must be > 0",
            ));
        }
        if self.negative_ttl_ms == 0 {
            return Err(SyncError::invalid_config("negative_ttl_ms must be > 0"));
        }
        if self.fetch_timeout_ms == 0 {
            return Err(SyncError::invalid_config("fetch_timeout_ms must be > 0"));
        }
        if self.sweep_interval_ms == 0 {
            return Err(SyncError::invalid_config("sweep_interval_ms must be > 0"));
        }
        if self.version_retention_ms < self.fetch_timeout_ms {
            return Err(SyncError::invalid_config(
                "version_retention_ms must be >= fetch_timeout_ms",
            ));
        }
        if self.event_capacity == 0 {
            return Err(SyncError::invalid_config("event_capacity must be > 0"));
        }
        if self.feed_backoff.multiplier < 1.0 || self.feed_backoff.initial_ms == 0 {
            return Err(SyncError::invalid_config(
                "feed_backoff needs initial_ms > 0 and multiplier >= 1.0",
            ));
        }
        let h = &self.health;
        if !(0.0..=1.0).contains(&h.min_hit_rate)
            || !(0.0..=1.0).contains(&h.max_eviction_rate)
            || !(0.0..=1.0).contains(&h.low_utilization)
        {
            return Err(SyncError::invalid_config(
                "health thresholds must be within 0.0..=1.0",
            ));
        }
        Ok(())
    }

    // ===================
    // Builders
    // ===================

    pub fn with_entity_policy(mut self, kind: EntityKind, capacity: usize, ttl: Duration) -> Self {
        *self.entities.get_mut(kind) = EntityPolicy::new(capacity, ttl);
        self
    }

    pub fn with_query_policy(mut self, capacity: usize, ttl: Duration) -> Self {
        self.queries = QueryPolicy {
            capacity,
            ttl_ms: ttl.as_millis() as u64,
        };
        self
    }

    pub fn with_batch_window(mut self, window: Duration) -> Self {
        self.batch_window_ms = window.as_millis() as u64;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_negative_ttl(mut self, ttl: Duration) -> Self {
        self.negative_ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_feed_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.feed_backoff = backoff;
        self
    }

    pub fn with_health_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.health = thresholds;
        self
    }

    // ===================
    // Duration accessors
    // ===================

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_millis(self.negative_ttl_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn version_retention(&self) -> Duration {
        Duration::from_millis(self.version_retention_ms)
    }
}
