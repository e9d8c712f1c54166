//! Entity kinds, keys and the typed dashboard records

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of addressable record held by the sync layer
///
/// Each kind gets its own cache partition with an independent capacity and TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Meeting,
    Team,
    Notification,
    UserProfile,
}

impl EntityKind {
    /// Every known kind, in partition order
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Meeting,
        EntityKind::Team,
        EntityKind::Notification,
        EntityKind::UserProfile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Meeting => "meeting",
            EntityKind::Team => "team",
            EntityKind::Notification => "notification",
            EntityKind::UserProfile => "user_profile",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "meeting" => Ok(EntityKind::Meeting),
            "team" => Ok(EntityKind::Team),
            "notification" => Ok(EntityKind::Notification),
            "user_profile" => Ok(EntityKind::UserProfile),
            _ => Err(ParseKeyError::new(s, "unknown entity kind")),
        }
    }
}

/// Globally unique key of an entity: kind + id
///
/// Renders as `kind:id` (e.g. `meeting:m1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    kind: EntityKind,
    id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for EntityKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| ParseKeyError::new(s, "missing ':' separator"))?;
        if id.is_empty() {
            return Err(ParseKeyError::new(s, "empty id"));
        }
        let kind = kind
            .parse::<EntityKind>()
            .map_err(|_| ParseKeyError::new(s, "unknown entity kind"))?;
        Ok(Self::new(kind, id))
    }
}

/// Error returned when parsing an [`EntityKind`] or [`EntityKey`] fails
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseKeyError {
    input: String,
    reason: &'static str,
}

impl ParseKeyError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

impl fmt::Display for ParseKeyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid entity key '{}': {}", self.input, self.reason)
    }
}

impl std::error::Error for ParseKeyError {}

/// A typed record stored as a JSON document upstream
pub trait Entity: Serialize + DeserializeOwned {
    const KIND: EntityKind;

    fn id(&self) -> &str;

    fn key(&self) -> EntityKey {
        EntityKey::new(Self::KIND, self.id())
    }
}

/// A meeting uploaded to a team
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meeting {
    pub id: String,
    pub team_id: String,
    pub owner_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub has_transcript: bool,
}

impl Entity for Meeting {
    const KIND: EntityKind = EntityKind::Meeting;

    fn id(&self) -> &str {
        &self.id
    }
}

/// A team and its roster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    #[serde(default)]
    pub member_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Team {
    pub fn has_member(&self, user_id: &str) -> bool {
        self.owner_id == user_id || self.member_ids.iter().any(|m| m == user_id)
    }
}

impl Entity for Team {
    const KIND: EntityKind = EntityKind::Team;

    fn id(&self) -> &str {
        &self.id
    }
}

/// A per-user notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Entity for Notification {
    const KIND: EntityKind = EntityKind::Notification;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Public profile of a dashboard user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub display_name: String,
    pub email: String,
    #[serde(default)]
    pub team_ids: Vec<String>,
}

impl Entity for UserProfile {
    const KIND: EntityKind = EntityKind::UserProfile;

    fn id(&self) -> &str {
        &self.id
    }
}
