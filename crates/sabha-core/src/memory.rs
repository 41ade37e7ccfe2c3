//! In-memory store used by tests and demo mode.
//!
//! One mutex guards the whole state, so every trait method is a single
//! critical section and the atomicity contract of [`RegistryStore`] holds
//! trivially. No lock is ever held across an await point. Compound
//! operations (`approve_request`, `revert_request`, `claim_team`) run all
//! of their precondition checks before the first mutation, so an error
//! return leaves the state untouched.

use crate::appeal::Appeal;
use crate::capacity::{CapacityPool, PoolScope, SequenceScope};
use crate::error::SabhaError;
use crate::fees::{Payment, PaymentPurpose};
use crate::request::{ChangeRequest, EntityKind, RequestStatus, TargetRef};
use crate::snapshot::FieldSnapshot;
use crate::store::RegistryStore;
use crate::types::Participation;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Default)]
struct MemoryInner {
    targets: BTreeMap<String, FieldSnapshot>,
    requests: BTreeMap<Uuid, ChangeRequest>,
    pools: BTreeMap<String, CapacityPool>,
    sequences: BTreeMap<String, u64>,
    teams: BTreeMap<(Uuid, Uuid), String>,
    participations: BTreeMap<Uuid, Participation>,
    payments: BTreeMap<Uuid, Payment>,
    appeals: BTreeMap<Uuid, Appeal>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a live entity directly, bypassing the request ledger. Test setup
    /// and data import only.
    pub fn seed_target(&self, target: TargetRef, fields: FieldSnapshot) {
        self.inner.lock().targets.insert(target.key(), fields);
    }

    /// Remove a live entity directly. Test setup only.
    pub fn remove_target(&self, target: &TargetRef) {
        self.inner.lock().targets.remove(&target.key());
    }
}

fn snapshot_of(
    targets: &BTreeMap<String, FieldSnapshot>,
    target: &TargetRef,
    fields: &[String],
) -> Result<FieldSnapshot, SabhaError> {
    let stored = targets
        .get(&target.key())
        .ok_or_else(|| SabhaError::NotFound(format!("target '{}'", target.key())))?;
    if fields.is_empty() {
        return Ok(stored.clone());
    }
    let mut out = FieldSnapshot::new();
    for field in fields {
        let value = stored.get(field).ok_or_else(|| {
            SabhaError::Validation(format!(
                "target '{}' has no field '{field}'",
                target.key()
            ))
        })?;
        out.insert(field.clone(), value.clone());
    }
    Ok(out)
}

fn capacity_error(pool: &CapacityPool, delta: i64) -> SabhaError {
    SabhaError::CapacityExceeded {
        scope: pool.scope_key.clone(),
        current: pool.current_count,
        limit: if delta >= 0 {
            pool.maximum_allowed
        } else {
            pool.minimum_allowed
        },
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn read_fields(
        &self,
        target: &TargetRef,
        fields: &[String],
    ) -> Result<FieldSnapshot, SabhaError> {
        let inner = self.inner.lock();
        snapshot_of(&inner.targets, target, fields)
    }

    async fn insert_request_with_snapshot(
        &self,
        mut request: ChangeRequest,
    ) -> Result<ChangeRequest, SabhaError> {
        let mut inner = self.inner.lock();
        if let Some(target) = &request.target {
            let fields = request.diff.proposed_fields();
            request.diff.original = snapshot_of(&inner.targets, target, &fields)?;
            request.diff.verify_snapshot_complete()?;
        }
        inner.requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn fetch_request(&self, id: Uuid) -> Result<ChangeRequest, SabhaError> {
        self.inner
            .lock()
            .requests
            .get(&id)
            .cloned()
            .ok_or_else(|| SabhaError::NotFound(format!("change request '{id}'")))
    }

    async fn transition_request(
        &self,
        id: Uuid,
        from: RequestStatus,
        to: RequestStatus,
    ) -> Result<ChangeRequest, SabhaError> {
        let mut inner = self.inner.lock();
        let request = inner
            .requests
            .get_mut(&id)
            .ok_or_else(|| SabhaError::NotFound(format!("change request '{id}'")))?;
        if request.status != from {
            return Err(SabhaError::invalid_state(from.name(), request.status.name()));
        }
        if !from.permits(to) {
            return Err(SabhaError::invalid_state(to.name(), from.name()));
        }
        request.status = to;
        request.updated_at = Utc::now();
        Ok(request.clone())
    }

    async fn approve_request(&self, id: Uuid) -> Result<ChangeRequest, SabhaError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let request = inner
            .requests
            .get_mut(&id)
            .ok_or_else(|| SabhaError::NotFound(format!("change request '{id}'")))?;
        if request.status != RequestStatus::Pending {
            return Err(SabhaError::invalid_state(
                RequestStatus::Pending.name(),
                request.status.name(),
            ));
        }

        // Checks first: nothing below may mutate until all of them pass.
        if let Some(demand) = request.capacity_demand {
            let pool = inner.pools.get(&demand.scope.key()).ok_or_else(|| {
                SabhaError::NotFound(format!("capacity pool '{}'", demand.scope.key()))
            })?;
            if !pool.admits(demand.delta) {
                return Err(capacity_error(pool, demand.delta));
            }
        }
        if !request.kind.is_addition() {
            let target = request.target.as_ref().ok_or_else(|| {
                SabhaError::Validation(format!("{} has no target", request.kind.name()))
            })?;
            if !inner.targets.contains_key(&target.key()) {
                return Err(SabhaError::NotFound(format!("target '{}'", target.key())));
            }
        }

        if let Some(demand) = request.capacity_demand {
            if let Some(pool) = inner.pools.get_mut(&demand.scope.key()) {
                pool.current_count += demand.delta;
            }
        }
        if request.kind.is_addition() {
            let created = TargetRef::new(EntityKind::Member, Uuid::new_v4());
            inner
                .targets
                .insert(created.key(), request.diff.proposed.clone());
            request.created_target = Some(created);
        } else if let Some(target) = request.target {
            if let Some(stored) = inner.targets.get_mut(&target.key()) {
                for (field, value) in &request.diff.proposed {
                    stored.insert(field.clone(), value.clone());
                }
            }
        }
        request.status = RequestStatus::Approved;
        request.updated_at = Utc::now();
        Ok(request.clone())
    }

    async fn revert_request(&self, id: Uuid) -> Result<ChangeRequest, SabhaError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let request = inner
            .requests
            .get_mut(&id)
            .ok_or_else(|| SabhaError::NotFound(format!("change request '{id}'")))?;
        if request.status != RequestStatus::Approved {
            return Err(SabhaError::invalid_state(
                RequestStatus::Approved.name(),
                request.status.name(),
            ));
        }

        if let Some(demand) = request.capacity_demand {
            let pool = inner.pools.get(&demand.scope.key()).ok_or_else(|| {
                SabhaError::NotFound(format!("capacity pool '{}'", demand.scope.key()))
            })?;
            if !pool.admits(-demand.delta) {
                return Err(capacity_error(pool, -demand.delta));
            }
        }
        let restore_key = request
            .created_target
            .as_ref()
            .or(request.target.as_ref())
            .map(TargetRef::key);
        if let Some(key) = &restore_key {
            if !inner.targets.contains_key(key) {
                return Err(SabhaError::NotFound(format!("target '{key}'")));
            }
        }

        if let Some(demand) = request.capacity_demand {
            if let Some(pool) = inner.pools.get_mut(&demand.scope.key()) {
                pool.current_count -= demand.delta;
            }
        }
        if let Some(created) = &request.created_target {
            inner.targets.remove(&created.key());
        } else if let Some(target) = request.target {
            if let Some(stored) = inner.targets.get_mut(&target.key()) {
                for (field, value) in &request.diff.original {
                    stored.insert(field.clone(), value.clone());
                }
            }
        }
        request.status = RequestStatus::Reverted;
        request.updated_at = Utc::now();
        Ok(request.clone())
    }

    async fn list_requests(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<ChangeRequest>, SabhaError> {
        let inner = self.inner.lock();
        let mut requests: Vec<ChangeRequest> = inner
            .requests
            .values()
            .filter(|request| status.map_or(true, |wanted| request.status == wanted))
            .cloned()
            .collect();
        requests.sort_by_key(|request| request.created_at);
        Ok(requests)
    }

    async fn ensure_pool(
        &self,
        scope: &PoolScope,
        minimum_allowed: i64,
        maximum_allowed: i64,
    ) -> Result<(), SabhaError> {
        let mut inner = self.inner.lock();
        match inner.pools.get_mut(&scope.key()) {
            Some(pool) => {
                pool.minimum_allowed = minimum_allowed;
                pool.maximum_allowed = maximum_allowed;
            }
            None => {
                inner.pools.insert(
                    scope.key(),
                    CapacityPool::new(scope, minimum_allowed, maximum_allowed),
                );
            }
        }
        Ok(())
    }

    async fn fetch_pool(&self, scope: &PoolScope) -> Result<Option<CapacityPool>, SabhaError> {
        Ok(self.inner.lock().pools.get(&scope.key()).cloned())
    }

    async fn reserve(&self, scope: &PoolScope, delta: i64) -> Result<i64, SabhaError> {
        let mut inner = self.inner.lock();
        let pool = inner
            .pools
            .get_mut(&scope.key())
            .ok_or_else(|| SabhaError::NotFound(format!("capacity pool '{}'", scope.key())))?;
        if !pool.admits(delta) {
            return Err(capacity_error(pool, delta));
        }
        pool.current_count += delta;
        Ok(pool.current_count)
    }

    async fn next_sequence(&self, scope: &SequenceScope) -> Result<u64, SabhaError> {
        let mut inner = self.inner.lock();
        let counter = inner.sequences.entry(scope.key()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn insert_participation(
        &self,
        participation: Participation,
    ) -> Result<Participation, SabhaError> {
        self.inner
            .lock()
            .participations
            .insert(participation.id, participation.clone());
        Ok(participation)
    }

    async fn fetch_participation(&self, id: Uuid) -> Result<Participation, SabhaError> {
        self.inner
            .lock()
            .participations
            .get(&id)
            .cloned()
            .ok_or_else(|| SabhaError::NotFound(format!("participation '{id}'")))
    }

    async fn delete_participation(&self, id: Uuid) -> Result<Participation, SabhaError> {
        self.inner
            .lock()
            .participations
            .remove(&id)
            .ok_or_else(|| SabhaError::NotFound(format!("participation '{id}'")))
    }

    async fn member_chest_number(&self, member_id: Uuid) -> Result<Option<String>, SabhaError> {
        let inner = self.inner.lock();
        Ok(inner
            .participations
            .values()
            .filter(|p| p.member_id == member_id && p.event_kind == crate::types::EventKind::Individual)
            .min_by_key(|p| p.created_at)
            .map(|p| p.chest_number.clone()))
    }

    async fn team_chest_number(
        &self,
        event_id: Uuid,
        unit_id: Uuid,
    ) -> Result<Option<String>, SabhaError> {
        Ok(self.inner.lock().teams.get(&(event_id, unit_id)).cloned())
    }

    async fn claim_team(
        &self,
        event_id: Uuid,
        unit_id: Uuid,
        candidate_chest: &str,
        teams_scope: &PoolScope,
    ) -> Result<String, SabhaError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(existing) = inner.teams.get(&(event_id, unit_id)) {
            return Ok(existing.clone());
        }
        let pool = inner
            .pools
            .get_mut(&teams_scope.key())
            .ok_or_else(|| SabhaError::NotFound(format!("capacity pool '{}'", teams_scope.key())))?;
        if !pool.admits(1) {
            return Err(capacity_error(pool, 1));
        }
        pool.current_count += 1;
        inner
            .teams
            .insert((event_id, unit_id), candidate_chest.to_string());
        Ok(candidate_chest.to_string())
    }

    async fn dissolve_team(&self, event_id: Uuid, unit_id: Uuid) -> Result<(), SabhaError> {
        self.inner.lock().teams.remove(&(event_id, unit_id));
        Ok(())
    }

    async fn insert_payment(&self, payment: Payment) -> Result<Payment, SabhaError> {
        self.inner.lock().payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn fetch_payment(&self, id: Uuid) -> Result<Payment, SabhaError> {
        self.inner
            .lock()
            .payments
            .get(&id)
            .cloned()
            .ok_or_else(|| SabhaError::NotFound(format!("payment '{id}'")))
    }

    async fn open_payment_for_district(
        &self,
        district_id: Uuid,
        purpose: PaymentPurpose,
    ) -> Result<Option<Payment>, SabhaError> {
        let inner = self.inner.lock();
        Ok(inner
            .payments
            .values()
            .find(|p| p.district_id == district_id && p.purpose == purpose && p.status.is_open())
            .cloned())
    }

    async fn update_payment(&self, payment: &Payment) -> Result<(), SabhaError> {
        let mut inner = self.inner.lock();
        if !inner.payments.contains_key(&payment.id) {
            return Err(SabhaError::NotFound(format!("payment '{}'", payment.id)));
        }
        inner.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn insert_appeal(&self, appeal: Appeal) -> Result<Appeal, SabhaError> {
        self.inner.lock().appeals.insert(appeal.id, appeal.clone());
        Ok(appeal)
    }

    async fn fetch_appeal(&self, id: Uuid) -> Result<Appeal, SabhaError> {
        self.inner
            .lock()
            .appeals
            .get(&id)
            .cloned()
            .ok_or_else(|| SabhaError::NotFound(format!("appeal '{id}'")))
    }

    async fn appeal_exists(
        &self,
        chest_number: &str,
        event_name: &str,
    ) -> Result<bool, SabhaError> {
        let inner = self.inner.lock();
        Ok(inner
            .appeals
            .values()
            .any(|a| a.chest_number == chest_number && a.event_name == event_name))
    }

    async fn update_appeal(&self, appeal: &Appeal) -> Result<(), SabhaError> {
        let mut inner = self.inner.lock();
        if !inner.appeals.contains_key(&appeal.id) {
            return Err(SabhaError::NotFound(format!("appeal '{}'", appeal.id)));
        }
        inner.appeals.insert(appeal.id, appeal.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::CapacityDemand;
    use serde_json::json;

    fn target_with(store: &MemoryStore, fields: &[(&str, serde_json::Value)]) -> TargetRef {
        let target = TargetRef::new(EntityKind::Member, Uuid::new_v4());
        store.seed_target(
            target,
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        );
        target
    }

    fn request_for(target: TargetRef, proposed: &[(&str, serde_json::Value)]) -> ChangeRequest {
        ChangeRequest {
            id: Uuid::new_v4(),
            kind: crate::request::RequestKind::MemberInfoChange,
            target: Some(target),
            created_target: None,
            diff: crate::snapshot::FieldDiff::proposing(
                proposed
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            ),
            capacity_demand: None,
            reason: "store level exercise".into(),
            proof_reference: None,
            status: RequestStatus::Pending,
            submitted_by: "unit-1".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn snapshot_is_captured_at_insert_time() {
        let store = MemoryStore::new();
        let target = target_with(&store, &[("name", json!("OLD")), ("dob", json!("2001"))]);

        let stored = store
            .insert_request_with_snapshot(request_for(target, &[("name", json!("NEW"))]))
            .await
            .unwrap();
        assert_eq!(stored.diff.original.get("name"), Some(&json!("OLD")));
        // Fields outside the proposal are not snapshotted.
        assert!(!stored.diff.original.contains_key("dob"));
    }

    #[tokio::test]
    async fn reserve_rejects_overdraw_and_leaves_count_unchanged() {
        let store = MemoryStore::new();
        let scope = PoolScope::EventTotal {
            event_id: Uuid::new_v4(),
        };
        store.ensure_pool(&scope, 0, 2).await.unwrap();

        assert_eq!(store.reserve(&scope, 1).await.unwrap(), 1);
        assert_eq!(store.reserve(&scope, 1).await.unwrap(), 2);

        let err = store.reserve(&scope, 1).await.unwrap_err();
        assert!(matches!(err, SabhaError::CapacityExceeded { current: 2, .. }));
        let pool = store.fetch_pool(&scope).await.unwrap().unwrap();
        assert_eq!(pool.current_count, 2);
    }

    #[tokio::test]
    async fn ensure_pool_refreshes_bounds_but_never_the_count() {
        let store = MemoryStore::new();
        let scope = PoolScope::DelegateSeats {
            district_id: Uuid::new_v4(),
        };
        store.ensure_pool(&scope, 0, 20).await.unwrap();
        store.reserve(&scope, 3).await.unwrap();

        store.ensure_pool(&scope, 0, 25).await.unwrap();
        let pool = store.fetch_pool(&scope).await.unwrap().unwrap();
        assert_eq!(pool.current_count, 3);
        assert_eq!(pool.maximum_allowed, 25);
    }

    #[tokio::test]
    async fn sequences_start_at_one_and_are_scoped() {
        let store = MemoryStore::new();
        let event_a = SequenceScope::IndividualEntries {
            event_id: Uuid::new_v4(),
        };
        let event_b = SequenceScope::IndividualEntries {
            event_id: Uuid::new_v4(),
        };

        assert_eq!(store.next_sequence(&event_a).await.unwrap(), 1);
        assert_eq!(store.next_sequence(&event_a).await.unwrap(), 2);
        assert_eq!(store.next_sequence(&event_b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn approval_is_decided_at_most_once() {
        let store = MemoryStore::new();
        let target = target_with(&store, &[("name", json!("X"))]);
        let id = store
            .insert_request_with_snapshot(request_for(target, &[("name", json!("Y"))]))
            .await
            .unwrap()
            .id;

        store.approve_request(id).await.unwrap();
        let err = store
            .transition_request(id, RequestStatus::Pending, RequestStatus::Rejected)
            .await
            .unwrap_err();
        assert!(matches!(err, SabhaError::InvalidState { .. }));
        let err = store.approve_request(id).await.unwrap_err();
        assert!(matches!(err, SabhaError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn approve_applies_fields_and_consumes_capacity_together() {
        let store = MemoryStore::new();
        let unit_id = Uuid::new_v4();
        let scope = PoolScope::CouncilorRoster { unit_id };
        store.ensure_pool(&scope, 0, 2).await.unwrap();
        let target = target_with(&store, &[("member_id", json!(null))]);

        let mut request = request_for(target, &[("member_id", json!("M-1"))]);
        request.capacity_demand = Some(CapacityDemand::new(scope, 1));
        let id = store
            .insert_request_with_snapshot(request)
            .await
            .unwrap()
            .id;
        store.approve_request(id).await.unwrap();

        let fields = store.read_fields(&target, &[]).await.unwrap();
        assert_eq!(fields.get("member_id"), Some(&json!("M-1")));
        let pool = store.fetch_pool(&scope).await.unwrap().unwrap();
        assert_eq!(pool.current_count, 1);
    }

    #[tokio::test]
    async fn approve_with_a_missing_pool_commits_nothing() {
        let store = MemoryStore::new();
        let target = target_with(&store, &[("member_id", json!(null))]);
        let mut request = request_for(target, &[("member_id", json!("M-1"))]);
        request.capacity_demand = Some(CapacityDemand::new(
            PoolScope::CouncilorRoster {
                unit_id: Uuid::new_v4(),
            },
            1,
        ));
        let id = store
            .insert_request_with_snapshot(request)
            .await
            .unwrap()
            .id;

        let err = store.approve_request(id).await.unwrap_err();
        assert!(matches!(err, SabhaError::NotFound(_)));
        let request = store.fetch_request(id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
        let fields = store.read_fields(&target, &[]).await.unwrap();
        assert_eq!(fields.get("member_id"), Some(&json!(null)));
    }

    #[tokio::test]
    async fn claim_team_charges_the_quota_exactly_once() {
        let store = MemoryStore::new();
        let event_id = Uuid::new_v4();
        let unit_id = Uuid::new_v4();
        let scope = PoolScope::DistrictTeams {
            event_id,
            district_id: Uuid::new_v4(),
        };
        store.ensure_pool(&scope, 0, 2).await.unwrap();

        let first = store
            .claim_team(event_id, unit_id, "GS-TVM-001", &scope)
            .await
            .unwrap();
        assert_eq!(first, "GS-TVM-001");

        // A second claim for the same unit keeps the installed chest and
        // does not consume another slot.
        let second = store
            .claim_team(event_id, unit_id, "GS-TVM-002", &scope)
            .await
            .unwrap();
        assert_eq!(second, "GS-TVM-001");
        let pool = store.fetch_pool(&scope).await.unwrap().unwrap();
        assert_eq!(pool.current_count, 1);
    }

    #[tokio::test]
    async fn dissolved_team_frees_the_claim() {
        let store = MemoryStore::new();
        let event_id = Uuid::new_v4();
        let unit_id = Uuid::new_v4();
        let scope = PoolScope::DistrictTeams {
            event_id,
            district_id: Uuid::new_v4(),
        };
        store.ensure_pool(&scope, 0, 1).await.unwrap();

        store
            .claim_team(event_id, unit_id, "GD-TVM-001", &scope)
            .await
            .unwrap();
        store.dissolve_team(event_id, unit_id).await.unwrap();
        store.reserve(&scope, -1).await.unwrap();

        let fresh = store
            .claim_team(event_id, unit_id, "GD-TVM-002", &scope)
            .await
            .unwrap();
        assert_eq!(fresh, "GD-TVM-002");
    }
}
