//! Diagnostics event bus using tokio::broadcast
//!
//! Every cache mutation and subscription lifecycle change is published here.
//! Nothing in the sync path depends on it; dashboards and tests subscribe to
//! observe what the layer is doing.

use crate::config::SyncConfig;
use teamboard_types::EntityKey;
use tokio::sync::broadcast;
use tracing::trace;

/// Events emitted by the sync layer
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Entity cache now holds a new value (local write, feed event or commit)
    EntityUpdated(EntityKey),
    /// Entity dropped from the cache (tombstone, eviction, expiry, scope reset)
    EntityInvalidated(EntityKey),
    /// Cached query ordering dropped
    QueryInvalidated(String),
    /// Optimistic write undone after the store rejected it
    WriteRolledBack(EntityKey),
    /// Upstream listener for a subscription dropped
    FeedDisconnected(String),
    /// Upstream listener re-established after a drop
    FeedReconnected(String),
    SubscriptionOpened(String),
    SubscriptionClosed(String),
    /// Periodic sweep finished
    SweepCompleted {
        expired_entities: usize,
        expired_queries: usize,
    },
}

/// Broadcast channel for [`SyncEvent`]s
///
/// Lagging receivers lose the oldest events; publishers never block and a
/// bus with no receivers drops everything.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: SyncEvent) {
        trace!(?event, "Sync event");
        let _ = self.sender.send(event);
    }

    /// One `QueryInvalidated` per dropped signature
    pub(crate) fn publish_invalidated(&self, signatures: impl IntoIterator<Item = String>) {
        for signature in signatures {
            self.publish(SyncEvent::QueryInvalidated(signature));
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(SyncConfig::default().event_capacity)
    }
}
