//! Data models for the teamboard sync layer

pub mod change;
pub mod entity;
pub mod health;
pub mod query;

pub use change::{Change, ChangeEvent, Staleness, StoredDocument};
pub use entity::{
    Entity, EntityKey, EntityKind, Meeting, Notification, ParseKeyError, Team, UserProfile,
};
pub use health::{HealthSnapshot, KindHealth, QueryHealth, Recommendation};
pub use query::{OrderBy, QuerySpec, Selector};
