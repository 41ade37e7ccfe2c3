use crate::error::SabhaError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppealStatus {
    Pending,
    Approved,
    Rejected,
}

impl AppealStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Result<Self, SabhaError> {
        match value {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(SabhaError::Storage(format!(
                "unknown appeal status '{other}'"
            ))),
        }
    }
}

/// A score dispute tied to a participation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appeal {
    pub id: Uuid,
    pub chest_number: String,
    pub event_name: String,
    pub statement: String,
    pub reply: Option<String>,
    /// Copied from the related result at creation time.
    pub score_published_at: DateTime<Utc>,
    pub status: AppealStatus,
    pub submitted_by: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an eligibility check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppealEligibility {
    pub eligible: bool,
    pub reason: Option<String>,
    pub minutes_elapsed: i64,
    /// Zero once the window has closed.
    pub minutes_remaining: i64,
}

/// Time-bounded appeal policy.
///
/// The upper bound is inclusive: an appeal raised at exactly
/// `score_published_at + window` is still accepted, so a submission landing
/// on the expiry instant is never rejected by an off-by-one.
#[derive(Debug, Clone)]
pub struct AppealWindow {
    pub window: Duration,
}

impl Default for AppealWindow {
    fn default() -> Self {
        Self {
            window: Duration::minutes(30),
        }
    }
}

impl AppealWindow {
    pub fn can_appeal(
        &self,
        score_published_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppealEligibility {
        let elapsed = now - score_published_at;
        let minutes_elapsed = elapsed.num_minutes().max(0);

        if elapsed <= self.window {
            let remaining = self.window - elapsed;
            return AppealEligibility {
                eligible: true,
                reason: None,
                minutes_elapsed,
                minutes_remaining: remaining.num_minutes().max(0),
            };
        }

        AppealEligibility {
            eligible: false,
            reason: Some(format!(
                "appeal window of {} minutes expired {} minutes after score publication",
                self.window.num_minutes(),
                minutes_elapsed
            )),
            minutes_elapsed,
            minutes_remaining: 0,
        }
    }
}
