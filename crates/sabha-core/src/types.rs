use crate::error::SabhaError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of the caller, supplied by the (external) identity layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    /// Unit-level registrant: may propose changes and register participants.
    Unit,
    /// Administrator: may approve, reject, and revert.
    Admin,
}

/// Identity/role context for one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: ActorRole,
}

impl Actor {
    pub fn unit(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: ActorRole::Unit,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: ActorRole::Admin,
        }
    }

    pub fn require_admin(&self) -> Result<(), SabhaError> {
        if self.role != ActorRole::Admin {
            return Err(SabhaError::Forbidden(format!(
                "actor '{}' lacks the admin role required for this transition",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Individual,
    Group,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Individual => "individual",
            Self::Group => "group",
        }
    }

    pub fn parse(value: &str) -> Result<Self, SabhaError> {
        match value {
            "individual" => Ok(Self::Individual),
            "group" => Ok(Self::Group),
            other => Err(SabhaError::Storage(format!("unknown event kind '{other}'"))),
        }
    }
}

/// Event definition as configured by reference data (external concern).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    pub id: Uuid,
    pub name: String,
    pub kind: EventKind,
    /// Total participation ceiling for the event.
    pub max_allowed_limit: i64,
    /// Per-unit sub-ceiling; meaningful for group events.
    pub per_unit_allowed_limit: i64,
}

/// A member's registration into an event.
///
/// All members of one team share a single chest number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participation {
    pub id: Uuid,
    pub event_id: Uuid,
    pub event_kind: EventKind,
    pub member_id: Uuid,
    pub unit_id: Uuid,
    pub district_id: Uuid,
    pub chest_number: String,
    pub added_by: String,
    pub created_at: DateTime<Utc>,
}
