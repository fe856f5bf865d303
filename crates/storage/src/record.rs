use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::timestamp::Timestamp;

/// Who performed a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    User,
    System,
    Ai,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
            Self::Ai => "ai",
        }
    }
}

impl fmt::Display for ActorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "system" => Ok(Self::System),
            "ai" => Ok(Self::Ai),
            _ => Err(format!("invalid actor kind: {}", s)),
        }
    }
}

/// The identity attached to every audit transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub kind: ActorKind,
}

impl Actor {
    pub fn new(id: impl Into<String>, kind: ActorKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(id, ActorKind::User)
    }

    pub fn system(id: impl Into<String>) -> Self {
        Self::new(id, ActorKind::System)
    }

    pub fn ai(id: impl Into<String>) -> Self {
        Self::new(id, ActorKind::Ai)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// A `(entity_type, entity_id)` pair naming one stored entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// An entity's current value as stored in the backend.
///
/// `value` is opaque to the repository. `version` starts at 0 on first save
/// and increments on every subsequent save of the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEntity {
    pub entity_type: String,
    pub entity_id: String,
    pub value: serde_json::Value,
    pub version: i64,
    pub updated_at: Timestamp,
}

impl StoredEntity {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(&self.entity_type, &self.entity_id)
    }
}

/// One immutable record of an entity moving between two named states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditTransition {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub from_state: String,
    pub to_state: String,
    pub actor: Actor,
    /// Human-readable reason for the transition.
    pub reason: String,
    pub at: Timestamp,
    /// Flat string map; nested values are not representable on purpose.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl AuditTransition {
    /// Feed ordering: `(at, id)` descending.
    pub fn newest_first(a: &AuditTransition, b: &AuditTransition) -> Ordering {
        b.at.cmp(&a.at).then_with(|| b.id.cmp(&a.id))
    }
}

/// Filter for `Repository::list_audit_trail`.
///
/// Every `Some` field narrows the result. `before_at` is an exclusive upper
/// bound and `limit` is applied after all other filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditQuery {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub actor_kind: Option<ActorKind>,
    pub before_at: Option<Timestamp>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn for_entity(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            entity_id: Some(entity_id.into()),
            ..Self::default()
        }
    }

    /// Whether `transition` passes every predicate (ignores `limit`).
    pub fn matches(&self, transition: &AuditTransition) -> bool {
        self.entity_type
            .as_deref()
            .map_or(true, |t| transition.entity_type == t)
            && self
                .entity_id
                .as_deref()
                .map_or(true, |id| transition.entity_id == id)
            && self
                .actor_kind
                .map_or(true, |kind| transition.actor.kind == kind)
            && self.before_at.map_or(true, |before| transition.at < before)
    }
}
