//! Rules engine tying the request ledger, capacity allocator, chest-number
//! generator, fee schedule, and appeal window together over one store.
//!
//! Contended writes lean on the store's atomic operations: approve and
//! revert are single store units (status flip, capacity change, and field
//! application commit together or not at all), and team creation in a group
//! event is a single store claim, so concurrent first batches can never
//! charge the district quota twice. The engine only composes multi-pool
//! reservations, releasing the pools it already holds when a later one
//! refuses.

use crate::appeal::{Appeal, AppealEligibility, AppealStatus, AppealWindow};
use crate::capacity::{CapacityDemand, CapacityPolicy, PoolScope, SequenceScope};
use crate::chest::{event_code, next_chest_number};
use crate::error::SabhaError;
use crate::fees::{FeeSchedule, Payment, PaymentPurpose, PaymentStatus};
use crate::request::{ChangeRequest, RequestKind, RequestStatus, TargetRef};
use crate::snapshot::{FieldDiff, FieldSnapshot};
use crate::store::RegistryStore;
use crate::types::{Actor, EventConfig, EventKind, Participation};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const MIN_REASON_LEN: usize = 10;
const ALLOWED_PROOF_EXTENSIONS: [&str; 4] = ["pdf", "png", "jpg", "jpeg"];

fn validate_reason(reason: &str) -> Result<(), SabhaError> {
    if reason.trim().len() < MIN_REASON_LEN {
        return Err(SabhaError::Validation(format!(
            "reason must be at least {MIN_REASON_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_proof_reference(reference: &str) -> Result<(), SabhaError> {
    let extension = reference
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if !ALLOWED_PROOF_EXTENSIONS.contains(&extension.as_str()) {
        return Err(SabhaError::Validation(format!(
            "proof reference '{reference}' must end in one of {ALLOWED_PROOF_EXTENSIONS:?}"
        )));
    }
    Ok(())
}

/// Everything a new change request needs from the caller.
#[derive(Debug, Clone)]
pub struct ChangeProposal {
    pub kind: RequestKind,
    /// Required unless `kind` is an addition.
    pub target: Option<TargetRef>,
    pub proposed: FieldSnapshot,
    /// Capacity the change consumes on approval (e.g. a councilor slot).
    pub capacity_demand: Option<CapacityDemand>,
    pub reason: String,
    pub proof_reference: Option<String>,
}

pub struct RegistryEngine {
    store: Arc<dyn RegistryStore>,
    policy: CapacityPolicy,
    fees: FeeSchedule,
    appeal_window: AppealWindow,
}

impl RegistryEngine {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store,
            policy: CapacityPolicy::default(),
            fees: FeeSchedule::default(),
            appeal_window: AppealWindow::default(),
        }
    }

    pub fn with_policy(mut self, policy: CapacityPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_fees(mut self, fees: FeeSchedule) -> Self {
        self.fees = fees;
        self
    }

    pub fn with_appeal_window(mut self, window: AppealWindow) -> Self {
        self.appeal_window = window;
        self
    }

    pub fn store(&self) -> &Arc<dyn RegistryStore> {
        &self.store
    }

    pub fn fees(&self) -> &FeeSchedule {
        &self.fees
    }

    pub fn policy(&self) -> &CapacityPolicy {
        &self.policy
    }

    // ----- change-request ledger -----

    pub async fn propose_change(
        &self,
        actor: &Actor,
        proposal: ChangeProposal,
    ) -> Result<ChangeRequest, SabhaError> {
        validate_reason(&proposal.reason)?;
        if let Some(reference) = &proposal.proof_reference {
            validate_proof_reference(reference)?;
        }
        if proposal.proposed.is_empty() {
            return Err(SabhaError::Validation(
                "proposal contains no fields".to_string(),
            ));
        }

        if proposal.kind.is_addition() {
            if proposal.target.is_some() {
                return Err(SabhaError::Validation(
                    "an addition must not name an existing target".to_string(),
                ));
            }
        } else {
            let target = proposal.target.as_ref().ok_or_else(|| {
                SabhaError::Validation(format!(
                    "{} requires a target",
                    proposal.kind.name()
                ))
            })?;
            let current = self
                .store
                .read_fields(target, &proposal.proposed.keys().cloned().collect::<Vec<_>>())
                .await?;
            let diff = FieldDiff::proposing(proposal.proposed.clone());
            if diff.is_noop(&current) {
                return Err(SabhaError::Validation(
                    "proposal does not change any field".to_string(),
                ));
            }
        }

        let now = Utc::now();
        let request = ChangeRequest {
            id: Uuid::new_v4(),
            kind: proposal.kind,
            target: proposal.target,
            created_target: None,
            diff: FieldDiff::proposing(proposal.proposed),
            capacity_demand: proposal.capacity_demand,
            reason: proposal.reason,
            proof_reference: proposal.proof_reference,
            status: RequestStatus::Pending,
            submitted_by: actor.id.clone(),
            created_at: now,
            updated_at: now,
        };

        let stored = self.store.insert_request_with_snapshot(request).await?;
        info!(
            request = %stored.id,
            kind = stored.kind.name(),
            submitted_by = %stored.submitted_by,
            "change request submitted"
        );
        Ok(stored)
    }

    pub async fn approve_change(
        &self,
        actor: &Actor,
        request_id: Uuid,
    ) -> Result<ChangeRequest, SabhaError> {
        actor.require_admin()?;
        let approved = self.store.approve_request(request_id).await?;
        info!(request = %request_id, approved_by = %actor.id, "change request approved");
        Ok(approved)
    }

    pub async fn reject_change(
        &self,
        actor: &Actor,
        request_id: Uuid,
    ) -> Result<ChangeRequest, SabhaError> {
        actor.require_admin()?;
        let rejected = self
            .store
            .transition_request(request_id, RequestStatus::Pending, RequestStatus::Rejected)
            .await?;
        info!(request = %request_id, rejected_by = %actor.id, "change request rejected");
        Ok(rejected)
    }

    /// Undo an approved change: the target's snapshotted fields are restored
    /// byte-for-byte, and an approved addition is deleted outright.
    pub async fn revert_change(
        &self,
        actor: &Actor,
        request_id: Uuid,
    ) -> Result<ChangeRequest, SabhaError> {
        actor.require_admin()?;
        let reverted = self.store.revert_request(request_id).await?;
        info!(request = %request_id, reverted_by = %actor.id, "change request reverted");
        Ok(reverted)
    }

    pub async fn pending_requests(&self) -> Result<Vec<ChangeRequest>, SabhaError> {
        self.store.list_requests(Some(RequestStatus::Pending)).await
    }

    // ----- capacity pool preparation -----

    /// Size the councilor roster pool of a unit from its member count.
    pub async fn prepare_councilor_pool(
        &self,
        unit_id: Uuid,
        member_count: u32,
    ) -> Result<(), SabhaError> {
        let limit = self.policy.councilor_roster_limit(member_count);
        self.store
            .ensure_pool(&PoolScope::CouncilorRoster { unit_id }, 0, limit)
            .await
    }

    pub async fn prepare_delegate_pool(&self, district_id: Uuid) -> Result<(), SabhaError> {
        let limit = self.policy.delegate_ceiling(district_id);
        self.store
            .ensure_pool(&PoolScope::DelegateSeats { district_id }, 0, limit)
            .await
    }

    pub async fn add_delegate(&self, actor: &Actor, district_id: Uuid) -> Result<i64, SabhaError> {
        actor.require_admin()?;
        self.prepare_delegate_pool(district_id).await?;
        self.store
            .reserve(&PoolScope::DelegateSeats { district_id }, 1)
            .await
    }

    pub async fn remove_delegate(
        &self,
        actor: &Actor,
        district_id: Uuid,
    ) -> Result<i64, SabhaError> {
        actor.require_admin()?;
        self.store
            .reserve(&PoolScope::DelegateSeats { district_id }, -1)
            .await
    }

    // ----- event participation -----

    pub async fn register_individual(
        &self,
        actor: &Actor,
        event: &EventConfig,
        member_id: Uuid,
        unit_id: Uuid,
        district_id: Uuid,
    ) -> Result<Participation, SabhaError> {
        if event.kind != EventKind::Individual {
            return Err(SabhaError::Validation(format!(
                "event '{}' is not an individual event",
                event.name
            )));
        }

        let member_scope = PoolScope::MemberEvents { member_id };
        let unit_scope = PoolScope::UnitEvent {
            event_id: event.id,
            unit_id,
        };
        let total_scope = PoolScope::EventTotal { event_id: event.id };

        self.store
            .ensure_pool(
                &member_scope,
                0,
                self.policy.max_individual_events_per_member,
            )
            .await?;
        self.store
            .ensure_pool(&unit_scope, 0, self.policy.max_per_unit_per_individual_event)
            .await?;
        self.store
            .ensure_pool(&total_scope, 0, event.max_allowed_limit)
            .await?;

        let mut reserved: Vec<PoolScope> = Vec::new();
        for scope in [member_scope, unit_scope, total_scope] {
            if let Err(err) = self.store.reserve(&scope, 1).await {
                self.release_all(&reserved, 1).await;
                return Err(err);
            }
            reserved.push(scope);
        }

        let result = self
            .individual_participation(actor, event, member_id, unit_id, district_id)
            .await;
        match result {
            Ok(participation) => Ok(participation),
            Err(err) => {
                self.release_all(&reserved, 1).await;
                Err(err)
            }
        }
    }

    async fn individual_participation(
        &self,
        actor: &Actor,
        event: &EventConfig,
        member_id: Uuid,
        unit_id: Uuid,
        district_id: Uuid,
    ) -> Result<Participation, SabhaError> {
        // A member keeps one chest number across every individual event.
        let chest_number = match self.store.member_chest_number(member_id).await? {
            Some(existing) => existing,
            None => {
                next_chest_number(
                    self.store.as_ref(),
                    &event_code(&event.name),
                    None,
                    &SequenceScope::IndividualEntries { event_id: event.id },
                )
                .await?
            }
        };

        let participation = Participation {
            id: Uuid::new_v4(),
            event_id: event.id,
            event_kind: EventKind::Individual,
            member_id,
            unit_id,
            district_id,
            chest_number,
            added_by: actor.id.clone(),
            created_at: Utc::now(),
        };
        let stored = self.store.insert_participation(participation).await?;
        info!(
            event = %event.name,
            member = %member_id,
            chest = %stored.chest_number,
            "individual participant registered"
        );
        Ok(stored)
    }

    /// Register a batch of members as (part of) the unit's team in a group
    /// event. All team members share one chest number; the district team
    /// quota is charged only when the batch starts a new team.
    pub async fn register_team(
        &self,
        actor: &Actor,
        event: &EventConfig,
        unit_code: &str,
        member_ids: &[Uuid],
        unit_id: Uuid,
        district_id: Uuid,
    ) -> Result<Vec<Participation>, SabhaError> {
        if event.kind != EventKind::Group {
            return Err(SabhaError::Validation(format!(
                "event '{}' is not a group event",
                event.name
            )));
        }
        if member_ids.is_empty() {
            return Err(SabhaError::Validation(
                "a team registration needs at least one member".to_string(),
            ));
        }

        let unit_scope = PoolScope::UnitEvent {
            event_id: event.id,
            unit_id,
        };
        let total_scope = PoolScope::EventTotal { event_id: event.id };
        let teams_scope = PoolScope::DistrictTeams {
            event_id: event.id,
            district_id,
        };

        self.store
            .ensure_pool(&unit_scope, 0, event.per_unit_allowed_limit)
            .await?;
        self.store
            .ensure_pool(&total_scope, 0, event.max_allowed_limit)
            .await?;
        self.store
            .ensure_pool(&teams_scope, 0, self.policy.max_teams_per_district)
            .await?;

        let batch = member_ids.len() as i64;
        let mut reserved: Vec<(PoolScope, i64)> = Vec::new();
        for (scope, delta) in [(unit_scope, batch), (total_scope, batch)] {
            if let Err(err) = self.store.reserve(&scope, delta).await {
                self.release_batches(&reserved).await;
                return Err(err);
            }
            reserved.push((scope, delta));
        }

        let chest_number = match self
            .team_chest(event, unit_code, unit_id, &teams_scope)
            .await
        {
            Ok(chest) => chest,
            Err(err) => {
                self.release_batches(&reserved).await;
                return Err(err);
            }
        };

        let mut participations = Vec::with_capacity(member_ids.len());
        for member_id in member_ids {
            let participation = Participation {
                id: Uuid::new_v4(),
                event_id: event.id,
                event_kind: EventKind::Group,
                member_id: *member_id,
                unit_id,
                district_id,
                chest_number: chest_number.clone(),
                added_by: actor.id.clone(),
                created_at: Utc::now(),
            };
            participations.push(self.store.insert_participation(participation).await?);
        }

        info!(
            event = %event.name,
            unit = %unit_id,
            chest = %chest_number,
            members = member_ids.len(),
            "team participants registered"
        );
        Ok(participations)
    }

    /// Remove one participation and free every slot it held.
    pub async fn withdraw_participation(
        &self,
        actor: &Actor,
        participation_id: Uuid,
    ) -> Result<Participation, SabhaError> {
        let removed = self.store.delete_participation(participation_id).await?;

        let unit_scope = PoolScope::UnitEvent {
            event_id: removed.event_id,
            unit_id: removed.unit_id,
        };
        let total_scope = PoolScope::EventTotal {
            event_id: removed.event_id,
        };
        let remaining_in_unit = self.store.reserve(&unit_scope, -1).await?;
        self.store.reserve(&total_scope, -1).await?;

        match removed.event_kind {
            EventKind::Individual => {
                self.store
                    .reserve(
                        &PoolScope::MemberEvents {
                            member_id: removed.member_id,
                        },
                        -1,
                    )
                    .await?;
            }
            EventKind::Group => {
                // Last member out dissolves the team and frees its district slot.
                if remaining_in_unit == 0 {
                    self.store
                        .dissolve_team(removed.event_id, removed.unit_id)
                        .await?;
                    self.store
                        .reserve(
                            &PoolScope::DistrictTeams {
                                event_id: removed.event_id,
                                district_id: removed.district_id,
                            },
                            -1,
                        )
                        .await?;
                }
            }
        }

        info!(
            participation = %participation_id,
            withdrawn_by = %actor.id,
            "participation withdrawn"
        );
        Ok(removed)
    }

    /// Chest number for the unit's team in a group event: the existing one
    /// when the team is already claimed, otherwise a freshly minted candidate
    /// offered to the store's atomic claim. A concurrent first batch may win
    /// the claim instead; its chest number comes back and the district quota
    /// is charged exactly once either way.
    async fn team_chest(
        &self,
        event: &EventConfig,
        unit_code: &str,
        unit_id: Uuid,
        teams_scope: &PoolScope,
    ) -> Result<String, SabhaError> {
        if let Some(existing) = self.store.team_chest_number(event.id, unit_id).await? {
            return Ok(existing);
        }
        let candidate = next_chest_number(
            self.store.as_ref(),
            &event_code(&event.name),
            Some(unit_code),
            &SequenceScope::TeamEntries { event_id: event.id },
        )
        .await?;
        self.store
            .claim_team(event.id, unit_id, &candidate, teams_scope)
            .await
    }

    async fn release_all(&self, reserved: &[PoolScope], delta: i64) {
        for scope in reserved {
            if let Err(err) = self.store.reserve(scope, -delta).await {
                warn!(scope = %scope.key(), error = %err, "release failed");
            }
        }
    }

    async fn release_batches(&self, reserved: &[(PoolScope, i64)]) {
        for (scope, delta) in reserved {
            if let Err(err) = self.store.reserve(scope, -delta).await {
                warn!(scope = %scope.key(), error = %err, "release failed");
            }
        }
    }

    // ----- payments -----

    /// Accrue the registration fee for a district's current allocation.
    /// At most one registration payment per district may be open at a time.
    pub async fn accrue_registration_payment(
        &self,
        actor: &Actor,
        district_id: Uuid,
        individual_count: u64,
        group_count: u64,
        proof_reference: Option<String>,
    ) -> Result<Payment, SabhaError> {
        if let Some(reference) = &proof_reference {
            validate_proof_reference(reference)?;
        }
        if let Some(open) = self
            .store
            .open_payment_for_district(district_id, PaymentPurpose::EventRegistration)
            .await?
        {
            return Err(SabhaError::Validation(format!(
                "district already has an open registration payment '{}'",
                open.id
            )));
        }

        let payment = Payment::accrue_registration(
            district_id,
            actor.id.clone(),
            individual_count,
            group_count,
            &self.fees,
            proof_reference,
        );
        let stored = self.store.insert_payment(payment).await?;
        info!(
            payment = %stored.id,
            district = %district_id,
            amount = stored.computed_amount,
            "registration payment accrued"
        );
        Ok(stored)
    }

    pub async fn settle_payment(
        &self,
        actor: &Actor,
        payment_id: Uuid,
        outcome: PaymentStatus,
    ) -> Result<Payment, SabhaError> {
        actor.require_admin()?;
        if !matches!(outcome, PaymentStatus::Paid | PaymentStatus::Declined) {
            return Err(SabhaError::Validation(format!(
                "settlement outcome must be paid or declined, not '{}'",
                outcome.name()
            )));
        }
        let mut payment = self.store.fetch_payment(payment_id).await?;
        payment.transition(outcome)?;
        self.store.update_payment(&payment).await?;
        info!(payment = %payment_id, outcome = outcome.name(), "payment settled");
        Ok(payment)
    }

    /// Attach a payment proof. A declined payment re-enters review through
    /// this path only.
    pub async fn upload_payment_proof(
        &self,
        actor: &Actor,
        payment_id: Uuid,
        proof_reference: String,
    ) -> Result<Payment, SabhaError> {
        validate_proof_reference(&proof_reference)?;
        let mut payment = self.store.fetch_payment(payment_id).await?;
        payment.proof_reference = Some(proof_reference);
        if payment.status == PaymentStatus::Declined {
            payment.transition(PaymentStatus::ProofUploaded)?;
        } else {
            payment.updated_at = Utc::now();
        }
        self.store.update_payment(&payment).await?;
        info!(payment = %payment_id, by = %actor.id, "payment proof uploaded");
        Ok(payment)
    }

    // ----- appeals -----

    pub fn appeal_eligibility(
        &self,
        score_published_at: chrono::DateTime<Utc>,
    ) -> AppealEligibility {
        self.appeal_window.can_appeal(score_published_at, Utc::now())
    }

    /// Raise a score dispute. Accepted only within the appeal window, once
    /// per chest number and event, and each acceptance accrues the appeal fee.
    pub async fn submit_appeal(
        &self,
        actor: &Actor,
        district_id: Uuid,
        chest_number: impl Into<String>,
        event_name: impl Into<String>,
        statement: impl Into<String>,
        score_published_at: chrono::DateTime<Utc>,
    ) -> Result<(Appeal, Payment), SabhaError> {
        let chest_number = chest_number.into();
        let event_name = event_name.into();
        let statement = statement.into();

        if statement.trim().is_empty() {
            return Err(SabhaError::Validation(
                "appeal statement must not be empty".to_string(),
            ));
        }

        let eligibility = self.appeal_eligibility(score_published_at);
        if !eligibility.eligible {
            return Err(SabhaError::Validation(
                eligibility
                    .reason
                    .unwrap_or_else(|| "appeal window closed".to_string()),
            ));
        }

        if self.store.appeal_exists(&chest_number, &event_name).await? {
            return Err(SabhaError::Validation(format!(
                "an appeal for chest '{chest_number}' in '{event_name}' already exists"
            )));
        }

        let appeal = Appeal {
            id: Uuid::new_v4(),
            chest_number,
            event_name,
            statement,
            reply: None,
            score_published_at,
            status: AppealStatus::Pending,
            submitted_by: actor.id.clone(),
            created_at: Utc::now(),
        };
        let stored = self.store.insert_appeal(appeal).await?;
        let fee = Payment::accrue_appeal(district_id, actor.id.clone(), &self.fees);
        let fee = self.store.insert_payment(fee).await?;

        info!(
            appeal = %stored.id,
            chest = %stored.chest_number,
            fee = fee.computed_amount,
            "appeal submitted"
        );
        Ok((stored, fee))
    }

    pub async fn decide_appeal(
        &self,
        actor: &Actor,
        appeal_id: Uuid,
        approve: bool,
        reply: impl Into<String>,
    ) -> Result<Appeal, SabhaError> {
        actor.require_admin()?;
        let mut appeal = self.store.fetch_appeal(appeal_id).await?;
        if appeal.status != AppealStatus::Pending {
            return Err(SabhaError::invalid_state(
                AppealStatus::Pending.name(),
                appeal.status.name(),
            ));
        }
        appeal.status = if approve {
            AppealStatus::Approved
        } else {
            AppealStatus::Rejected
        };
        appeal.reply = Some(reply.into());
        self.store.update_appeal(&appeal).await?;
        info!(appeal = %appeal_id, decision = appeal.status.name(), "appeal decided");
        Ok(appeal)
    }
}
