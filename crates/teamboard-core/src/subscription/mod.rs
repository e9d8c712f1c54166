//! Live subscriptions
//!
//! Identical selectors share one [`SharedSubscription`]: one upstream change
//! feed, one pending change set, one batch timer. Each caller keeps its own
//! observer and gets its own callback per batch.
//!
//! - `registry`: signature -> shared subscription, batching state, dispatch
//! - `multiplexer`: subscribe/unsubscribe, feed and batch tasks, reconnects

pub mod multiplexer;
pub mod registry;

pub use multiplexer::SubscriptionMultiplexer;
pub use registry::{SharedSubscription, SubscriptionRegistry};

use crate::document::DocumentSnapshot;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use teamboard_types::{EntityKey, Staleness};

/// Callback receiving batched live updates
///
/// Runs on a runtime worker; keep it short and non-blocking.
pub type Observer = Arc<dyn Fn(&LiveUpdate) + Send + Sync>;

/// Identifier of one caller's registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Token returned by `live_subscribe`; pass it to `cancel`
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct LiveHandle {
    id: SubscriptionId,
    signature: String,
}

impl LiveHandle {
    pub(crate) fn new(id: SubscriptionId, signature: String) -> Self {
        Self { id, signature }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Signature of the selector this handle observes
    pub fn signature(&self) -> &str {
        &self.signature
    }
}

/// One batched delivery to an observer
#[derive(Debug, Clone)]
pub struct LiveUpdate {
    pub signature: String,
    /// Refreshed query result, or last-known-good when stale
    pub documents: Vec<DocumentSnapshot>,
    /// Keys changed since the previous dispatch
    pub changed_keys: Vec<EntityKey>,
    pub staleness: Staleness,
    pub dispatched_at: DateTime<Utc>,
}

impl LiveUpdate {
    pub fn ids(&self) -> Vec<&str> {
        self.documents.iter().map(|d| d.key.id()).collect()
    }

    pub fn is_stale(&self) -> bool {
        self.staleness.is_stale()
    }
}
