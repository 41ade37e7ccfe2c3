use crate::capacity::CapacityDemand;
use crate::error::SabhaError;
use crate::snapshot::FieldDiff;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The five change-request variants sharing one lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    MemberTransfer,
    MemberInfoChange,
    OfficialsChange,
    CouncilorChange,
    MemberAddition,
}

impl RequestKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::MemberTransfer => "member_transfer",
            Self::MemberInfoChange => "member_info_change",
            Self::OfficialsChange => "officials_change",
            Self::CouncilorChange => "councilor_change",
            Self::MemberAddition => "member_addition",
        }
    }

    /// Additions create a fresh entity, so there is no prior state to snapshot.
    pub fn is_addition(self) -> bool {
        matches!(self, Self::MemberAddition)
    }
}

/// Request lifecycle status.
///
/// PENDING -> APPROVED | REJECTED, APPROVED -> REVERTED. REVERTED is an
/// explicit terminal marker: re-opening PENDING would falsely imply the
/// request is re-approvable, and overloading REJECTED would erase the audit
/// distinction between "never applied" and "applied then undone".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Reverted,
}

impl RequestStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Reverted => "reverted",
        }
    }

    pub fn parse(value: &str) -> Result<Self, SabhaError> {
        match value {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "reverted" => Ok(Self::Reverted),
            other => Err(SabhaError::Storage(format!(
                "unknown request status '{other}'"
            ))),
        }
    }

    pub fn permits(self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved)
                | (Self::Pending, Self::Rejected)
                | (Self::Approved, Self::Reverted)
        )
    }
}

/// Kind of live entity a request mutates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Member,
    Officials,
    Councilor,
}

impl EntityKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Officials => "officials",
            Self::Councilor => "councilor",
        }
    }

    pub fn parse(value: &str) -> Result<Self, SabhaError> {
        match value {
            "member" => Ok(Self::Member),
            "officials" => Ok(Self::Officials),
            "councilor" => Ok(Self::Councilor),
            other => Err(SabhaError::Storage(format!("unknown entity kind '{other}'"))),
        }
    }
}

/// Reference to a live entity in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    pub entity: EntityKind,
    pub id: Uuid,
}

impl TargetRef {
    pub fn new(entity: EntityKind, id: Uuid) -> Self {
        Self { entity, id }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.entity.name(), self.id)
    }
}

/// One proposed mutation with its immutable prior-state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: Uuid,
    pub kind: RequestKind,
    /// Absent for additions until approval creates the entity.
    pub target: Option<TargetRef>,
    /// Set when a MemberAddition is approved, so revert knows what to delete.
    pub created_target: Option<TargetRef>,
    pub diff: FieldDiff,
    /// Capacity this request consumes on approval and frees on revert.
    pub capacity_demand: Option<CapacityDemand>,
    pub reason: String,
    pub proof_reference: Option<String>,
    pub status: RequestStatus,
    pub submitted_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_permits_only_forward_transitions() {
        assert!(RequestStatus::Pending.permits(RequestStatus::Approved));
        assert!(RequestStatus::Pending.permits(RequestStatus::Rejected));
        assert!(RequestStatus::Approved.permits(RequestStatus::Reverted));

        assert!(!RequestStatus::Approved.permits(RequestStatus::Pending));
        assert!(!RequestStatus::Rejected.permits(RequestStatus::Approved));
        assert!(!RequestStatus::Reverted.permits(RequestStatus::Pending));
        assert!(!RequestStatus::Pending.permits(RequestStatus::Reverted));
    }

    #[test]
    fn status_name_roundtrip() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Approved,
            RequestStatus::Rejected,
            RequestStatus::Reverted,
        ] {
            assert_eq!(RequestStatus::parse(status.name()).unwrap(), status);
        }
        assert!(RequestStatus::parse("resurrected").is_err());
    }

    #[test]
    fn only_member_addition_is_an_addition() {
        assert!(RequestKind::MemberAddition.is_addition());
        assert!(!RequestKind::MemberTransfer.is_addition());
        assert!(!RequestKind::CouncilorChange.is_addition());
    }
}
