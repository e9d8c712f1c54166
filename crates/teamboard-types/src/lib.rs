//! teamboard-types - Shared data types for the teamboard sync layer
//!
//! This crate contains pure data structures without heavy dependencies.
//! No tokio, no async runtime - just serde-serializable types.
//!
//! Used by:
//! - teamboard-core (cache, coordinator, subscriptions)
//! - request handlers consuming the sync layer

pub mod models;

pub use models::{
    Change, ChangeEvent, Entity, EntityKey, EntityKind, HealthSnapshot, KindHealth, Meeting,
    Notification, OrderBy, ParseKeyError, QueryHealth, QuerySpec, Recommendation, Selector,
    Staleness, StoredDocument, Team, UserProfile,
};
