//! Subscription multiplexer
//!
//! The first `subscribe` for a selector opens the upstream change feed and
//! spawns two tasks for it:
//! - feed task: applies each event through the coordinator, reconnecting
//!   with backoff when the upstream drops the listener
//! - batch task: waits for the first change, sleeps one batch window,
//!   refreshes the query and dispatches to every observer once
//!
//! Later callers with the same selector just add an observer. Cancelling
//! the last observer tears the feed down before `unsubscribe` returns.

use super::registry::{ObserverSlot, SharedSubscription};
use super::{LiveHandle, Observer, SubscriptionId};
use crate::config::BackoffConfig;
use crate::coordinator::InvalidationCoordinator;
use crate::error::SyncResult;
use crate::event::SyncEvent;
use crate::upstream::ChangeFeed;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use teamboard_types::Selector;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Deduplicates live queries and owns their background tasks
pub struct SubscriptionMultiplexer {
    coordinator: Arc<InvalidationCoordinator>,
    handles: DashMap<SubscriptionId, String>,
    next_id: AtomicU64,
    runtime: Handle,
    batch_window: Duration,
    backoff: BackoffConfig,
}

impl SubscriptionMultiplexer {
    pub fn new(coordinator: Arc<InvalidationCoordinator>, runtime: Handle) -> Self {
        let batch_window = coordinator.config().batch_window();
        let backoff = coordinator.config().feed_backoff;
        Self {
            coordinator,
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
            runtime,
            batch_window,
            backoff,
        }
    }

    /// Register interest in a selector
    ///
    /// No callback fires until the first change after this call.
    pub fn subscribe(&self, selector: Selector, observer: Observer) -> SyncResult<LiveHandle> {
        let signature = selector.signature();
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(ObserverSlot::new(id, observer));

        match self.coordinator.registry().map().entry(signature.clone()) {
            Entry::Occupied(existing) => {
                existing.get().add_observer(slot);
                debug!(query = %signature, subscription = %id, "Joined shared subscription");
            }
            Entry::Vacant(vacant) => {
                let feed = self.coordinator.store().open_change_feed(&selector)?;
                let shared = Arc::new(SharedSubscription::new(selector, self.batch_window));
                shared.add_observer(slot);
                shared.set_feed(feed.id);
                self.spawn_tasks(&shared, feed);
                vacant.insert(shared);

                self.coordinator
                    .events()
                    .publish(SyncEvent::SubscriptionOpened(signature.clone()));
                debug!(query = %signature, subscription = %id, "Opened subscription");
            }
        }

        self.handles.insert(id, signature.clone());
        Ok(LiveHandle::new(id, signature))
    }

    /// Cancel one caller's interest
    ///
    /// On return no callback for this handle is running or will run. When it
    /// was the last observer of its selector the upstream listener has been
    /// deregistered. Returns false for an unknown or already-cancelled handle.
    pub fn unsubscribe(&self, handle: LiveHandle) -> bool {
        let Some((id, signature)) = self.handles.remove(&handle.id()) else {
            return false;
        };

        if let Some(shared) = self.coordinator.registry().get(&signature) {
            if let Some(slot) = shared.take_observer(id) {
                slot.deactivate();
            }
        }

        let removed = self
            .coordinator
            .registry()
            .map()
            .remove_if(&signature, |_, shared| shared.observer_count() == 0);

        if let Some((_, shared)) = removed {
            shared.teardown(self.coordinator.store().as_ref());
            self.coordinator
                .events()
                .publish(SyncEvent::SubscriptionClosed(signature.clone()));
            debug!(query = %signature, "Closed subscription");
        }
        true
    }

    /// Tear down every subscription; used on shutdown
    pub fn close_all(&self) -> usize {
        self.handles.clear();
        let closed = self
            .coordinator
            .registry()
            .close_all(self.coordinator.store().as_ref());
        if closed > 0 {
            info!(closed, "Closed all live subscriptions");
        }
        closed
    }

    pub fn active_subscriptions(&self) -> usize {
        self.coordinator.registry().active_subscriptions()
    }

    pub fn live_observers(&self) -> usize {
        self.coordinator.registry().live_observers()
    }

    fn spawn_tasks(&self, shared: &Arc<SharedSubscription>, feed: ChangeFeed) {
        let batcher = self.runtime.spawn(run_batcher(
            Arc::clone(&self.coordinator),
            Arc::clone(shared),
        ));
        let listener = self.runtime.spawn(run_feed(
            Arc::clone(&self.coordinator),
            Arc::clone(shared),
            feed,
            self.backoff,
        ));
        shared.attach_task(batcher);
        shared.attach_task(listener);
    }
}

async fn run_batcher(coordinator: Arc<InvalidationCoordinator>, shared: Arc<SharedSubscription>) {
    loop {
        shared.wait_for_changes().await;
        if shared.is_closed() {
            break;
        }
        tokio::time::sleep(shared.batch_window()).await;

        let Some(batch) = shared.take_batch() else {
            continue;
        };
        let refreshed = coordinator.read_query(shared.selector()).await;
        shared.dispatch(batch, refreshed);
    }
}

async fn run_feed(
    coordinator: Arc<InvalidationCoordinator>,
    shared: Arc<SharedSubscription>,
    mut feed: ChangeFeed,
    backoff: BackoffConfig,
) {
    loop {
        while let Some(event) = feed.events.recv().await {
            coordinator.apply_change(event).await;
        }
        if shared.is_closed() {
            break;
        }

        warn!(query = %shared.signature(), listener = %feed.id, "Change feed disconnected");
        coordinator
            .events()
            .publish(SyncEvent::FeedDisconnected(shared.signature().to_string()));
        shared.mark_feed_lost("change feed disconnected");

        match reconnect(&coordinator, &shared, backoff).await {
            Some(new_feed) => feed = new_feed,
            None => break,
        }

        // events during the gap are lost; drop everything they could have touched
        coordinator.invalidate_scope(shared.selector());
        shared.mark_feed_restored();
        coordinator
            .events()
            .publish(SyncEvent::FeedReconnected(shared.signature().to_string()));
        info!(query = %shared.signature(), listener = %feed.id, "Change feed reconnected");
    }
}

/// Reopen a feed with exponential backoff. `None` once the subscription closed.
async fn reconnect(
    coordinator: &InvalidationCoordinator,
    shared: &SharedSubscription,
    backoff: BackoffConfig,
) -> Option<ChangeFeed> {
    let mut attempt = 0u32;
    loop {
        tokio::time::sleep(backoff.delay(attempt)).await;
        match shared.reopen_feed(coordinator.store().as_ref())? {
            Ok(feed) => return Some(feed),
            Err(err) => {
                debug!(query = %shared.signature(), attempt, error = %err, "Feed reconnect failed");
                attempt = attempt.saturating_add(1);
            }
        }
    }
}
