use crate::error::SabhaError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fee rates in whole currency units. Defaults are the original deployment's
/// production schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub individual_rate: u64,
    pub group_rate: u64,
    pub appeal_fee: u64,
    /// Per-head conference delegation rate (officials and members alike).
    pub delegate_rate: u64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            individual_rate: 50,
            group_rate: 100,
            appeal_fee: 1000,
            delegate_rate: 300,
        }
    }
}

impl FeeSchedule {
    /// Registration fee for the current allocation counts. Pure; callers
    /// recompute whenever counts change rather than caching.
    pub fn compute_fee(&self, individual_count: u64, group_count: u64) -> u64 {
        individual_count * self.individual_rate + group_count * self.group_rate
    }

    pub fn delegate_fee(&self, official_count: u64, member_count: u64) -> u64 {
        (official_count + member_count) * self.delegate_rate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    ProofUploaded,
    Paid,
    Declined,
}

impl PaymentStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ProofUploaded => "proof_uploaded",
            Self::Paid => "paid",
            Self::Declined => "declined",
        }
    }

    pub fn parse(value: &str) -> Result<Self, SabhaError> {
        match value {
            "pending" => Ok(Self::Pending),
            "proof_uploaded" => Ok(Self::ProofUploaded),
            "paid" => Ok(Self::Paid),
            "declined" => Ok(Self::Declined),
            other => Err(SabhaError::Storage(format!(
                "unknown payment status '{other}'"
            ))),
        }
    }

    /// PENDING and PROOF_UPLOADED await review; PAID is terminal; DECLINED
    /// allows one more round via proof re-upload.
    pub fn permits(self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Paid)
                | (Self::Pending, Self::Declined)
                | (Self::ProofUploaded, Self::Paid)
                | (Self::ProofUploaded, Self::Declined)
                | (Self::Declined, Self::ProofUploaded)
        )
    }

    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::ProofUploaded)
    }
}

/// What a payment settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentPurpose {
    EventRegistration,
    Appeal,
    Delegation,
}

impl PaymentPurpose {
    pub fn name(self) -> &'static str {
        match self {
            Self::EventRegistration => "event_registration",
            Self::Appeal => "appeal",
            Self::Delegation => "delegation",
        }
    }

    pub fn parse(value: &str) -> Result<Self, SabhaError> {
        match value {
            "event_registration" => Ok(Self::EventRegistration),
            "appeal" => Ok(Self::Appeal),
            "delegation" => Ok(Self::Delegation),
            other => Err(SabhaError::Storage(format!(
                "unknown payment purpose '{other}'"
            ))),
        }
    }
}

/// Point-in-time obligation record.
///
/// `computed_amount` snapshots the fee at creation; later allocation drift
/// never rewrites an existing payment. A new payment (or an explicit update)
/// is required to reflect new counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub district_id: Uuid,
    pub purpose: PaymentPurpose,
    pub individual_count: u64,
    pub group_count: u64,
    pub computed_amount: u64,
    pub status: PaymentStatus,
    pub proof_reference: Option<String>,
    pub paid_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn accrue_registration(
        district_id: Uuid,
        paid_by: impl Into<String>,
        individual_count: u64,
        group_count: u64,
        schedule: &FeeSchedule,
        proof_reference: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            district_id,
            purpose: PaymentPurpose::EventRegistration,
            individual_count,
            group_count,
            computed_amount: schedule.compute_fee(individual_count, group_count),
            status: PaymentStatus::Pending,
            proof_reference,
            paid_by: paid_by.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn accrue_appeal(
        district_id: Uuid,
        paid_by: impl Into<String>,
        schedule: &FeeSchedule,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            district_id,
            purpose: PaymentPurpose::Appeal,
            individual_count: 0,
            group_count: 0,
            computed_amount: schedule.appeal_fee,
            status: PaymentStatus::Pending,
            proof_reference: None,
            paid_by: paid_by.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: PaymentStatus) -> Result<(), SabhaError> {
        if !self.status.permits(next) {
            return Err(SabhaError::invalid_state(next.name(), self.status.name()));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}
