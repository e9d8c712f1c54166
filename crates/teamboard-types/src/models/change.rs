//! Change-feed events, versioned documents and staleness markers

use super::entity::EntityKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// New state carried by a change-feed event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Change {
    /// Entity created or replaced
    Upsert(Value),
    /// Entity deleted
    Tombstone,
}

/// One mutation delivered by the upstream change feed
///
/// `sequence` is the store's monotonic marker; for a given key it strictly
/// increases with every committed write and is the only ordering authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub key: EntityKey,
    pub change: Change,
    pub sequence: u64,
}

impl ChangeEvent {
    pub fn upsert(key: EntityKey, value: Value, sequence: u64) -> Self {
        Self {
            key,
            change: Change::Upsert(value),
            sequence,
        }
    }

    pub fn tombstone(key: EntityKey, sequence: u64) -> Self {
        Self {
            key,
            change: Change::Tombstone,
            sequence,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.change, Change::Tombstone)
    }

    /// New value, or None for a tombstone
    pub fn value(&self) -> Option<&Value> {
        match &self.change {
            Change::Upsert(v) => Some(v),
            Change::Tombstone => None,
        }
    }
}

/// A document as returned by the persistent store
///
/// `version` equals the feed sequence of the write that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub key: EntityKey,
    pub value: Value,
    pub version: u64,
}

/// Whether displayed data is known to reflect the latest upstream state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Staleness {
    #[default]
    Fresh,
    /// Last-known-good data kept after a failed refresh or a feed drop
    Stale {
        since: DateTime<Utc>,
        reason: String,
    },
}

impl Staleness {
    pub fn stale(reason: impl Into<String>) -> Self {
        Staleness::Stale {
            since: Utc::now(),
            reason: reason.into(),
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Staleness::Stale { .. })
    }
}
