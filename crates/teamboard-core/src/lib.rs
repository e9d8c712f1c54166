//! teamboard-core - Data synchronization and caching layer for teamboard
//!
//! Sits between the managed document store's change feed and the dashboard:
//! entity and query caches, a single-writer invalidation coordinator,
//! shared live subscriptions with batched dispatch, and health accounting.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod event;
pub mod health;
pub mod layer;
pub mod subscription;
pub mod sweeper;
pub mod upstream;

pub use cache::{EntityCache, Lookup, QueryCache};
pub use config::{BackoffConfig, EntityPolicies, EntityPolicy, HealthThresholds, QueryPolicy, SyncConfig};
pub use coordinator::InvalidationCoordinator;
pub use document::{DocumentSnapshot, QueryResult};
pub use error::{SyncError, SyncResult};
pub use event::{EventBus, SyncEvent};
pub use health::{recommend, HealthMonitor};
pub use layer::SyncLayer;
pub use subscription::{LiveHandle, LiveUpdate, Observer, SubscriptionId, SubscriptionMultiplexer};
pub use sweeper::CacheSweeper;
pub use upstream::{ChangeFeed, DocumentStore, InMemoryDocumentStore, ListenerId};

pub use teamboard_types as types;
