use crate::appeal::Appeal;
use crate::capacity::{CapacityPool, PoolScope, SequenceScope};
use crate::error::SabhaError;
use crate::fees::{Payment, PaymentPurpose};
use crate::memory::MemoryStore;
use crate::postgres::PostgresStore;
use crate::request::{ChangeRequest, RequestStatus, TargetRef};
use crate::snapshot::FieldSnapshot;
use crate::types::Participation;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Persistence backend configuration.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    /// Keep all state in process memory only; used by tests and demo mode.
    Memory,
    /// Persist in PostgreSQL; schema is created on bootstrap.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }

    pub async fn bootstrap(self) -> Result<Arc<dyn RegistryStore>, SabhaError> {
        match self {
            Self::Memory => Ok(Arc::new(MemoryStore::new())),
            Self::Postgres {
                database_url,
                max_connections,
            } => {
                let store = PostgresStore::connect(&database_url, max_connections).await?;
                store.ensure_schema().await?;
                Ok(Arc::new(store))
            }
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Durable state behind the engine.
///
/// Concurrency contract: every method is a single atomic unit (one
/// serialized critical section in memory, one conditional statement or
/// transaction in PostgreSQL). In particular:
/// - `insert_request_with_snapshot` captures the target's current field
///   values and persists the request together, so a concurrent mutation of
///   the target can never produce a snapshot that disagrees with the state
///   the request was proposed against.
/// - `approve_request` and `revert_request` combine the status check, the
///   capacity consumption/release, and the field application into one unit:
///   either all of it commits or none of it does, and under concurrent
///   callers exactly one decision on a request can succeed.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    // Live targets. Entities are stored as field maps so one apply/revert
    // algorithm covers every request kind.
    async fn read_fields(
        &self,
        target: &TargetRef,
        fields: &[String],
    ) -> Result<FieldSnapshot, SabhaError>;

    // Change requests.
    async fn insert_request_with_snapshot(
        &self,
        request: ChangeRequest,
    ) -> Result<ChangeRequest, SabhaError>;
    async fn fetch_request(&self, id: Uuid) -> Result<ChangeRequest, SabhaError>;
    /// Conditional status transition with no side effects, used for
    /// transitions that mutate nothing else (PENDING -> REJECTED). Fails
    /// with `InvalidState` when the stored status is not `from`.
    async fn transition_request(
        &self,
        id: Uuid,
        from: RequestStatus,
        to: RequestStatus,
    ) -> Result<ChangeRequest, SabhaError>;
    /// Atomically approve a PENDING request: consume its capacity demand,
    /// apply the proposed fields to the target (or create the entity for an
    /// addition, recording it on the request), and set APPROVED. Any
    /// failure leaves the request PENDING with no capacity consumed and no
    /// field written.
    async fn approve_request(&self, id: Uuid) -> Result<ChangeRequest, SabhaError>;
    /// Atomically revert an APPROVED request: release its capacity demand,
    /// restore the snapshotted fields (or delete a created entity), and set
    /// REVERTED. Any failure leaves the request APPROVED with no capacity
    /// released and no field restored.
    async fn revert_request(&self, id: Uuid) -> Result<ChangeRequest, SabhaError>;
    async fn list_requests(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<ChangeRequest>, SabhaError>;

    // Capacity pools and identifier sequences.
    /// Create the pool if absent; refresh bounds (never the count) if present.
    async fn ensure_pool(
        &self,
        scope: &PoolScope,
        minimum_allowed: i64,
        maximum_allowed: i64,
    ) -> Result<(), SabhaError>;
    async fn fetch_pool(&self, scope: &PoolScope) -> Result<Option<CapacityPool>, SabhaError>;
    /// Atomic check-and-reserve; negative `delta` releases. Returns the new
    /// count, or `CapacityExceeded` leaving the pool untouched.
    async fn reserve(&self, scope: &PoolScope, delta: i64) -> Result<i64, SabhaError>;
    /// Atomically reserve the next integer in `scope`, starting at 1.
    async fn next_sequence(&self, scope: &SequenceScope) -> Result<u64, SabhaError>;

    // Participations.
    async fn insert_participation(
        &self,
        participation: Participation,
    ) -> Result<Participation, SabhaError>;
    async fn fetch_participation(&self, id: Uuid) -> Result<Participation, SabhaError>;
    async fn delete_participation(&self, id: Uuid) -> Result<Participation, SabhaError>;
    /// Chest number the member already holds from an earlier individual
    /// entry, if any.
    async fn member_chest_number(&self, member_id: Uuid) -> Result<Option<String>, SabhaError>;
    /// Chest number of the unit's existing team in the event, if any.
    async fn team_chest_number(
        &self,
        event_id: Uuid,
        unit_id: Uuid,
    ) -> Result<Option<String>, SabhaError>;
    /// Atomically decide who creates the unit's team in a group event. The
    /// first caller consumes one slot in `teams_scope` and installs
    /// `candidate_chest` as the team's chest number; every later (or
    /// concurrently racing) caller gets the installed chest number back
    /// without charging the quota.
    async fn claim_team(
        &self,
        event_id: Uuid,
        unit_id: Uuid,
        candidate_chest: &str,
        teams_scope: &PoolScope,
    ) -> Result<String, SabhaError>;
    /// Drop the team record for a unit in an event. Idempotent.
    async fn dissolve_team(&self, event_id: Uuid, unit_id: Uuid) -> Result<(), SabhaError>;

    // Payments.
    async fn insert_payment(&self, payment: Payment) -> Result<Payment, SabhaError>;
    async fn fetch_payment(&self, id: Uuid) -> Result<Payment, SabhaError>;
    async fn open_payment_for_district(
        &self,
        district_id: Uuid,
        purpose: PaymentPurpose,
    ) -> Result<Option<Payment>, SabhaError>;
    async fn update_payment(&self, payment: &Payment) -> Result<(), SabhaError>;

    // Appeals.
    async fn insert_appeal(&self, appeal: Appeal) -> Result<Appeal, SabhaError>;
    async fn fetch_appeal(&self, id: Uuid) -> Result<Appeal, SabhaError>;
    async fn appeal_exists(
        &self,
        chest_number: &str,
        event_name: &str,
    ) -> Result<bool, SabhaError>;
    async fn update_appeal(&self, appeal: &Appeal) -> Result<(), SabhaError>;
}
