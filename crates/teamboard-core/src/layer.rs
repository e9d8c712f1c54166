//! Sync layer facade
//!
//! The explicitly constructed entry point handed to request handlers. Each
//! instance owns its caches, subscriptions and sweeper; nothing is
//! process-global, so independent instances can run side by side.

use crate::config::SyncConfig;
use crate::coordinator::InvalidationCoordinator;
use crate::document::{DocumentSnapshot, QueryResult};
use crate::error::{SyncError, SyncResult};
use crate::event::EventBus;
use crate::health::HealthMonitor;
use crate::subscription::{LiveHandle, LiveUpdate, SubscriptionMultiplexer};
use crate::sweeper::CacheSweeper;
use crate::upstream::DocumentStore;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use teamboard_types::{Entity, EntityKey, EntityKind, HealthSnapshot, QuerySpec, Selector};
use tokio::runtime::Handle;
use tracing::info;

/// Data synchronization and caching layer
pub struct SyncLayer {
    coordinator: Arc<InvalidationCoordinator>,
    multiplexer: SubscriptionMultiplexer,
    health: HealthMonitor,
    sweeper: Mutex<Option<CacheSweeper>>,
    shut_down: AtomicBool,
}

impl SyncLayer {
    /// Build a layer over `store` and start its sweeper
    ///
    /// Must be called inside a tokio runtime; background tasks run on it.
    pub async fn start(store: Arc<dyn DocumentStore>, config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| SyncError::NotStarted)?;

        let events = EventBus::new(config.event_capacity);
        let sweep_interval = config.sweep_interval();
        let coordinator = Arc::new(InvalidationCoordinator::new(config, store, events));
        let multiplexer = SubscriptionMultiplexer::new(Arc::clone(&coordinator), runtime.clone());
        let health = HealthMonitor::new(Arc::clone(&coordinator));
        let sweeper = CacheSweeper::start(Arc::clone(&coordinator), sweep_interval, &runtime);

        info!(
            batch_window_ms = coordinator.config().batch_window_ms,
            fetch_timeout_ms = coordinator.config().fetch_timeout_ms,
            "Sync layer started"
        );

        Ok(Self {
            coordinator,
            multiplexer,
            health,
            sweeper: Mutex::new(Some(sweeper)),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Start with default configuration
    pub async fn with_defaults(store: Arc<dyn DocumentStore>) -> SyncResult<Self> {
        Self::start(store, SyncConfig::default()).await
    }

    fn ensure_running(&self) -> SyncResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SyncError::ShutDown);
        }
        Ok(())
    }

    // ===================
    // Reads
    // ===================

    pub async fn read(&self, kind: EntityKind, id: &str) -> SyncResult<DocumentSnapshot> {
        self.read_key(&EntityKey::new(kind, id)).await
    }

    pub async fn read_key(&self, key: &EntityKey) -> SyncResult<DocumentSnapshot> {
        self.ensure_running()?;
        self.coordinator.read(key).await
    }

    /// Read and decode a typed entity
    pub async fn read_as<T: Entity>(&self, id: &str) -> SyncResult<T> {
        self.read(T::KIND, id).await?.decode()
    }

    pub async fn read_query(&self, spec: &QuerySpec) -> SyncResult<QueryResult> {
        self.ensure_running()?;
        self.coordinator.read_query(spec).await
    }

    // ===================
    // Writes
    // ===================

    /// Optimistic write; see [`InvalidationCoordinator::write`]
    pub async fn write(&self, kind: EntityKind, id: &str, value: Value) -> SyncResult<DocumentSnapshot> {
        self.ensure_running()?;
        self.coordinator.write(&EntityKey::new(kind, id), value).await
    }

    pub async fn write_as<T: Entity>(&self, entity: &T) -> SyncResult<DocumentSnapshot> {
        self.ensure_running()?;
        let key = entity.key();
        let value = serde_json::to_value(entity).map_err(|source| SyncError::Encode {
            key: key.clone(),
            source,
        })?;
        self.coordinator.write(&key, value).await
    }

    // ===================
    // Live subscriptions
    // ===================

    /// Observe a selector; the observer runs once per batch window with changes
    pub fn live_subscribe<F>(&self, selector: Selector, observer: F) -> SyncResult<LiveHandle>
    where
        F: Fn(&LiveUpdate) + Send + Sync + 'static,
    {
        self.ensure_running()?;
        self.multiplexer.subscribe(selector, Arc::new(observer))
    }

    /// Cancel a live subscription. No callback for `handle` runs after this returns.
    pub fn cancel(&self, handle: LiveHandle) -> bool {
        self.multiplexer.unsubscribe(handle)
    }

    // ===================
    // Introspection
    // ===================

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    pub fn event_bus(&self) -> &EventBus {
        self.coordinator.events()
    }

    pub fn config(&self) -> &SyncConfig {
        self.coordinator.config()
    }

    /// Cached value of an entity, without fetching
    pub fn peek_cached(&self, key: &EntityKey) -> Option<Arc<Value>> {
        self.coordinator.peek(key)
    }

    /// Run an expiry sweep now. Returns (expired entities, expired queries).
    pub fn sweep_now(&self) -> (usize, usize) {
        self.coordinator.sweep()
    }

    /// Forget all cached data; live subscriptions stay open
    pub fn clear_caches(&self) {
        self.coordinator.clear_caches();
    }

    pub fn coordinator(&self) -> &Arc<InvalidationCoordinator> {
        &self.coordinator
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stop the sweeper and tear down every live subscription
    ///
    /// Later reads, writes and subscribes fail with `SyncError::ShutDown`.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let closed = self.multiplexer.close_all();
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }
        info!(subscriptions_closed = closed, "Sync layer shut down");
    }
}
