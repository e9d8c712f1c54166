//! Registry of shared subscriptions and their batching state
//!
//! Locking:
//! - the registry map is only held for lookups and insert/remove, never
//!   while an observer runs
//! - each subscription has its own state mutex (no global lock)
//! - each observer slot has a reentrant lock held for the duration of its
//!   callback; deactivating a slot waits for an in-flight callback, which is
//!   what makes cancellation final

use super::{LiveUpdate, Observer, SubscriptionId};
use crate::document::{DocumentSnapshot, QueryResult};
use crate::error::SyncResult;
use crate::upstream::{ChangeFeed, DocumentStore, ListenerId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use serde_json::Value;
use std::cell::Cell;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use teamboard_types::{EntityKey, EntityKind, Selector, Staleness};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

/// One caller's observer
pub(crate) struct ObserverSlot {
    id: SubscriptionId,
    active: ReentrantMutex<Cell<bool>>,
    callback: Observer,
}

impl ObserverSlot {
    pub(crate) fn new(id: SubscriptionId, callback: Observer) -> Self {
        Self {
            id,
            active: ReentrantMutex::new(Cell::new(true)),
            callback,
        }
    }

    /// Stop future callbacks, waiting out one already running on another thread
    pub(crate) fn deactivate(&self) {
        let active = self.active.lock();
        active.set(false);
    }

    fn invoke(&self, update: &LiveUpdate) -> bool {
        let active = self.active.lock();
        if !active.get() {
            return false;
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.callback)(update)));
        if outcome.is_err() {
            error!(
                subscription = %self.id,
                query = %update.signature,
                "Observer panicked during dispatch"
            );
        }
        true
    }
}

/// Keys taken out of the pending set for one dispatch
#[derive(Debug)]
pub(crate) struct Batch {
    pub(crate) changed_keys: Vec<EntityKey>,
}

struct BatchState {
    observers: Vec<Arc<ObserverSlot>>,
    pending: BTreeSet<EntityKey>,
    /// A batch window is running
    armed: bool,
    /// Dispatch even with an empty change set (feed gap, reconnect)
    refresh_requested: bool,
    last_dispatch_at: Option<Instant>,
    last_good: Vec<DocumentSnapshot>,
    feed_connected: bool,
    stale: Option<(DateTime<Utc>, String)>,
}

/// State shared by every caller of one selector
pub struct SharedSubscription {
    signature: String,
    selector: Selector,
    batch_window: Duration,
    state: Mutex<BatchState>,
    wake: Notify,
    closed: AtomicBool,
    feed: Mutex<Option<ListenerId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SharedSubscription {
    pub(crate) fn new(selector: Selector, batch_window: Duration) -> Self {
        Self {
            signature: selector.signature(),
            selector,
            batch_window,
            state: Mutex::new(BatchState {
                observers: Vec::new(),
                pending: BTreeSet::new(),
                armed: false,
                refresh_requested: false,
                last_dispatch_at: None,
                last_good: Vec::new(),
                feed_connected: true,
                stale: None,
            }),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            feed: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn batch_window(&self) -> Duration {
        self.batch_window
    }

    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn last_dispatch_at(&self) -> Option<Instant> {
        self.state.lock().last_dispatch_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn feed_listener(&self) -> Option<ListenerId> {
        *self.feed.lock()
    }

    pub(crate) fn add_observer(&self, slot: Arc<ObserverSlot>) {
        self.state.lock().observers.push(slot);
    }

    /// Detach an observer, returning its slot
    pub(crate) fn take_observer(&self, id: SubscriptionId) -> Option<Arc<ObserverSlot>> {
        let mut state = self.state.lock();
        let position = state.observers.iter().position(|slot| slot.id == id)?;
        Some(state.observers.remove(position))
    }

    /// Whether a change from `old` to `new` on an entity of `kind` may affect this selector
    ///
    /// With neither value known the change is assumed relevant.
    pub(crate) fn could_match(&self, kind: EntityKind, old: Option<&Value>, new: Option<&Value>) -> bool {
        if self.selector.kind != kind {
            return false;
        }
        match (old, new) {
            (None, None) => true,
            _ => {
                old.is_some_and(|v| self.selector.could_contain(kind, v))
                    || new.is_some_and(|v| self.selector.could_contain(kind, v))
            }
        }
    }

    /// Add a key to the pending set, starting a batch window if none runs
    pub(crate) fn mark_changed(&self, key: EntityKey) {
        let start_window = {
            let mut state = self.state.lock();
            state.pending.insert(key);
            !std::mem::replace(&mut state.armed, true)
        };
        if start_window {
            self.wake.notify_one();
        }
    }

    /// Schedule a dispatch even without pending keys
    pub(crate) fn request_refresh(&self) {
        let start_window = {
            let mut state = self.state.lock();
            state.refresh_requested = true;
            !std::mem::replace(&mut state.armed, true)
        };
        if start_window {
            self.wake.notify_one();
        }
    }

    pub(crate) fn mark_feed_lost(&self, reason: impl Into<String>) {
        {
            let mut state = self.state.lock();
            state.feed_connected = false;
            if state.stale.is_none() {
                state.stale = Some((Utc::now(), reason.into()));
            }
        }
        self.request_refresh();
    }

    pub(crate) fn mark_feed_restored(&self) {
        self.state.lock().feed_connected = true;
        self.request_refresh();
    }

    /// Wait for the start of the next batch window
    pub(crate) async fn wait_for_changes(&self) {
        self.wake.notified().await;
    }

    /// Close the current window and take what accumulated in it
    pub(crate) fn take_batch(&self) -> Option<Batch> {
        let mut state = self.state.lock();
        state.armed = false;
        if state.pending.is_empty() && !state.refresh_requested {
            return None;
        }
        state.refresh_requested = false;
        let changed_keys = std::mem::take(&mut state.pending).into_iter().collect();
        Some(Batch { changed_keys })
    }

    /// Deliver one batch to every active observer
    ///
    /// A failed refresh delivers the last-known-good documents flagged stale.
    /// Returns the number of observers invoked.
    pub(crate) fn dispatch(&self, batch: Batch, refreshed: SyncResult<QueryResult>) -> usize {
        if self.is_closed() {
            trace!(query = %self.signature, "Discarding refresh for closed subscription");
            return 0;
        }

        let (update, observers) = {
            let mut state = self.state.lock();
            let staleness = match refreshed {
                Ok(result) => {
                    state.last_good = result.documents;
                    if state.feed_connected {
                        state.stale = None;
                    }
                    staleness_of(&state.stale)
                }
                Err(err) => {
                    warn!(query = %self.signature, error = %err, "Live refresh failed, serving last known good");
                    if state.stale.is_none() {
                        state.stale = Some((Utc::now(), err.to_string()));
                    }
                    staleness_of(&state.stale)
                }
            };
            state.last_dispatch_at = Some(Instant::now());

            let update = LiveUpdate {
                signature: self.signature.clone(),
                documents: state.last_good.clone(),
                changed_keys: batch.changed_keys,
                staleness,
                dispatched_at: Utc::now(),
            };
            (update, state.observers.clone())
        };

        let mut delivered = 0;
        for slot in observers {
            if self.is_closed() {
                break;
            }
            if slot.invoke(&update) {
                delivered += 1;
            }
        }
        trace!(
            query = %self.signature,
            observers = delivered,
            changed = update.changed_keys.len(),
            stale = update.is_stale(),
            "Dispatched live update"
        );
        delivered
    }

    pub(crate) fn set_feed(&self, id: ListenerId) {
        *self.feed.lock() = Some(id);
    }

    /// Open a replacement feed unless the subscription closed meanwhile
    pub(crate) fn reopen_feed(&self, store: &dyn DocumentStore) -> Option<SyncResult<ChangeFeed>> {
        let mut feed = self.feed.lock();
        if self.is_closed() {
            return None;
        }
        let opened = store.open_change_feed(&self.selector);
        if let Ok(ref new_feed) = opened {
            *feed = Some(new_feed.id);
        }
        Some(opened)
    }

    pub(crate) fn attach_task(&self, task: JoinHandle<()>) {
        if self.is_closed() {
            task.abort();
            return;
        }
        self.tasks.lock().push(task);
    }

    /// Deregister the upstream listener and stop background tasks
    ///
    /// Synchronous: when this returns no feed is registered for this
    /// subscription and no further dispatch can start.
    pub(crate) fn teardown(&self, store: &dyn DocumentStore) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(id) = self.feed.lock().take() {
            store.close_change_feed(id);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let observers = std::mem::take(&mut self.state.lock().observers);
        for slot in observers {
            slot.deactivate();
        }
        debug!(query = %self.signature, "Subscription torn down");
    }
}

fn staleness_of(stale: &Option<(DateTime<Utc>, String)>) -> Staleness {
    match stale {
        Some((since, reason)) => Staleness::Stale {
            since: *since,
            reason: reason.clone(),
        },
        None => Staleness::Fresh,
    }
}

/// Signature -> shared subscription
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: DashMap<String, Arc<SharedSubscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn map(&self) -> &DashMap<String, Arc<SharedSubscription>> {
        &self.subscriptions
    }

    pub fn get(&self, signature: &str) -> Option<Arc<SharedSubscription>> {
        self.subscriptions.get(signature).map(|s| Arc::clone(s.value()))
    }

    /// Number of distinct live selectors
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    /// Number of registered observers across all selectors
    pub fn live_observers(&self) -> usize {
        self.subscriptions
            .iter()
            .map(|s| s.value().observer_count())
            .sum()
    }

    /// Add a changed key to every subscription whose selector could match.
    /// Returns the number of subscriptions marked.
    pub(crate) fn enqueue(&self, key: &EntityKey, old: Option<&Value>, new: Option<&Value>) -> usize {
        let mut marked = 0;
        for entry in self.subscriptions.iter() {
            let subscription = entry.value();
            if subscription.could_match(key.kind(), old, new) {
                subscription.mark_changed(key.clone());
                marked += 1;
            }
        }
        if marked > 0 {
            trace!(key = %key, subscriptions = marked, "Enqueued change");
        }
        marked
    }

    /// Remove and tear down every subscription
    pub(crate) fn close_all(&self, store: &dyn DocumentStore) -> usize {
        let signatures: Vec<String> = self.subscriptions.iter().map(|s| s.key().clone()).collect();
        let mut closed = 0;
        for signature in signatures {
            if let Some((_, subscription)) = self.subscriptions.remove(&signature) {
                subscription.teardown(store);
                closed += 1;
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use teamboard_types::QuerySpec;

    fn user_meetings() -> SharedSubscription {
        SharedSubscription::new(
            QuerySpec::new(EntityKind::Meeting).filter("ownerId", "U1"),
            Duration::from_millis(100),
        )
    }

    fn counting_slot(id: u64, counter: Arc<AtomicUsize>) -> Arc<ObserverSlot> {
        Arc::new(ObserverSlot::new(
            SubscriptionId(id),
            Arc::new(move |_: &LiveUpdate| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        ))
    }

    fn empty_result(signature: &str) -> SyncResult<QueryResult> {
        Ok(QueryResult {
            signature: signature.to_string(),
            documents: Vec::new(),
            from_cache: false,
        })
    }

    #[test]
    fn test_could_match_old_or_new_value() {
        let sub = user_meetings();
        let mine = json!({"ownerId": "U1"});
        let theirs = json!({"ownerId": "U2"});

        assert!(sub.could_match(EntityKind::Meeting, None, Some(&mine)));
        assert!(sub.could_match(EntityKind::Meeting, Some(&mine), Some(&theirs)));
        assert!(!sub.could_match(EntityKind::Meeting, Some(&theirs), Some(&theirs)));
        assert!(sub.could_match(EntityKind::Meeting, None, None));
        assert!(!sub.could_match(EntityKind::Team, None, None));
    }

    #[test]
    fn test_changes_coalesce_into_one_batch() {
        let sub = user_meetings();
        let key = |id: &str| EntityKey::new(EntityKind::Meeting, id);

        sub.mark_changed(key("m1"));
        sub.mark_changed(key("m2"));
        sub.mark_changed(key("m1"));
        assert_eq!(sub.pending_count(), 2);

        let batch = sub.take_batch().unwrap();
        assert_eq!(batch.changed_keys, vec![key("m1"), key("m2")]);
        assert!(sub.take_batch().is_none());
    }

    #[test]
    fn test_failed_refresh_keeps_last_good_and_flags_stale() {
        let sub = user_meetings();
        let seen = Arc::new(Mutex::new(Vec::<LiveUpdate>::new()));
        let sink = Arc::clone(&seen);
        sub.add_observer(Arc::new(ObserverSlot::new(
            SubscriptionId(1),
            Arc::new(move |u: &LiveUpdate| sink.lock().push(u.clone())),
        )));

        let doc = DocumentSnapshot::new(
            EntityKey::new(EntityKind::Meeting, "m1"),
            Arc::new(json!({"ownerId": "U1"})),
        );
        let ok = Ok(QueryResult {
            signature: sub.signature().to_string(),
            documents: vec![doc],
            from_cache: false,
        });
        sub.dispatch(Batch { changed_keys: vec![] }, ok);
        sub.dispatch(
            Batch { changed_keys: vec![] },
            Err(SyncError::store("unreachable")),
        );
        sub.dispatch(Batch { changed_keys: vec![] }, empty_result(sub.signature()));

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(!seen[0].is_stale());
        assert!(seen[1].is_stale());
        assert_eq!(seen[1].ids(), vec!["m1"]);
        assert!(!seen[2].is_stale());
        assert!(seen[2].documents.is_empty());
    }

    #[test]
    fn test_feed_loss_flags_stale_until_restored() {
        let sub = user_meetings();
        let seen = Arc::new(Mutex::new(Vec::<bool>::new()));
        let sink = Arc::clone(&seen);
        sub.add_observer(Arc::new(ObserverSlot::new(
            SubscriptionId(1),
            Arc::new(move |u: &LiveUpdate| sink.lock().push(u.is_stale())),
        )));

        sub.mark_feed_lost("listener dropped");
        let batch = sub.take_batch().unwrap();
        sub.dispatch(batch, empty_result(sub.signature()));

        sub.mark_feed_restored();
        let batch = sub.take_batch().unwrap();
        sub.dispatch(batch, empty_result(sub.signature()));

        assert_eq!(*seen.lock(), vec![true, false]);
    }

    #[test]
    fn test_panicking_observer_does_not_block_others() {
        let sub = user_meetings();
        let counter = Arc::new(AtomicUsize::new(0));
        sub.add_observer(Arc::new(ObserverSlot::new(
            SubscriptionId(1),
            Arc::new(|_: &LiveUpdate| panic!("observer bug")),
        )));
        sub.add_observer(counting_slot(2, Arc::clone(&counter)));

        let delivered = sub.dispatch(Batch { changed_keys: vec![] }, empty_result(sub.signature()));
        assert_eq!(delivered, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deactivated_slot_is_skipped() {
        let sub = user_meetings();
        let counter = Arc::new(AtomicUsize::new(0));
        let slot = counting_slot(7, Arc::clone(&counter));
        sub.add_observer(Arc::clone(&slot));

        slot.deactivate();
        assert_eq!(sub.dispatch(Batch { changed_keys: vec![] }, empty_result(sub.signature())), 0);
        assert!(sub.take_observer(SubscriptionId(7)).is_some());
        assert_eq!(sub.observer_count(), 0);
    }

    #[test]
    fn test_enqueue_routes_by_selector() {
        let registry = SubscriptionRegistry::new();
        let mine = Arc::new(user_meetings());
        let teams = Arc::new(SharedSubscription::new(
            QuerySpec::new(EntityKind::Team),
            Duration::from_millis(100),
        ));
        registry.map().insert(mine.signature().to_string(), Arc::clone(&mine));
        registry.map().insert(teams.signature().to_string(), Arc::clone(&teams));

        let key = EntityKey::new(EntityKind::Meeting, "m1");
        let marked = registry.enqueue(&key, None, Some(&json!({"ownerId": "U1"})));
        assert_eq!(marked, 1);
        assert_eq!(mine.pending_count(), 1);
        assert_eq!(teams.pending_count(), 0);
        assert_eq!(registry.active_subscriptions(), 2);
    }
}
