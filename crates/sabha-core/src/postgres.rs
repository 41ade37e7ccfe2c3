//! PostgreSQL store.
//!
//! Every atomicity-sensitive operation is a single conditional statement
//! (`UPDATE ... WHERE <precondition>` checked via `rows_affected` or
//! `RETURNING`) or a single transaction. Snapshot capture locks the target
//! row; approve and revert lock the request row `FOR UPDATE` and carry the
//! capacity change, the field application, and the status flip in one
//! transaction, so a failure at any step rolls back all of it.

use crate::appeal::{Appeal, AppealStatus};
use crate::capacity::{CapacityDemand, CapacityPool, PoolScope, SequenceScope};
use crate::error::SabhaError;
use crate::fees::{Payment, PaymentPurpose, PaymentStatus};
use crate::request::{ChangeRequest, EntityKind, RequestKind, RequestStatus, TargetRef};
use crate::snapshot::{FieldDiff, FieldSnapshot};
use crate::store::RegistryStore;
use crate::types::{EventKind, Participation};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

fn col<'r, T>(row: &'r PgRow, name: &str) -> Result<T, SabhaError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| SabhaError::Storage(format!("postgres decode {name} failed: {e}")))
}

fn snapshot_from_value(value: Value, name: &str) -> Result<FieldSnapshot, SabhaError> {
    serde_json::from_value(value)
        .map_err(|e| SabhaError::Serialization(format!("{name} snapshot decode failed: {e}")))
}

fn count_from_db(value: i64, name: &str) -> Result<u64, SabhaError> {
    value
        .try_into()
        .map_err(|_| SabhaError::Storage(format!("negative {name} in storage")))
}

fn count_to_db(value: u64, name: &str) -> Result<i64, SabhaError> {
    i64::try_from(value)
        .map_err(|_| SabhaError::Storage(format!("{name} exceeds postgres BIGINT range")))
}

fn target_ref_from_row(
    row: &PgRow,
    entity_col: &str,
    id_col: &str,
) -> Result<Option<TargetRef>, SabhaError> {
    let entity: Option<String> = col(row, entity_col)?;
    let id: Option<Uuid> = col(row, id_col)?;
    match (entity, id) {
        (Some(entity), Some(id)) => Ok(Some(TargetRef::new(EntityKind::parse(&entity)?, id))),
        (None, None) => Ok(None),
        _ => Err(SabhaError::Storage(format!(
            "half-populated target pair {entity_col}/{id_col} in storage"
        ))),
    }
}

fn request_from_row(row: &PgRow) -> Result<ChangeRequest, SabhaError> {
    let kind: String = col(row, "kind")?;
    let status: String = col(row, "status")?;
    let demand: Option<Value> = col(row, "capacity_demand")?;
    let capacity_demand = demand
        .map(|value| {
            serde_json::from_value::<CapacityDemand>(value).map_err(|e| {
                SabhaError::Serialization(format!("capacity demand decode failed: {e}"))
            })
        })
        .transpose()?;

    Ok(ChangeRequest {
        id: col(row, "id")?,
        kind: parse_request_kind(&kind)?,
        target: target_ref_from_row(row, "target_entity", "target_id")?,
        created_target: target_ref_from_row(row, "created_entity", "created_id")?,
        diff: FieldDiff {
            proposed: snapshot_from_value(col(row, "proposed")?, "proposed")?,
            original: snapshot_from_value(col(row, "original")?, "original")?,
        },
        capacity_demand,
        reason: col(row, "reason")?,
        proof_reference: col(row, "proof_reference")?,
        status: RequestStatus::parse(&status)?,
        submitted_by: col(row, "submitted_by")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn participation_from_row(row: &PgRow) -> Result<Participation, SabhaError> {
    let kind: String = col(row, "event_kind")?;
    Ok(Participation {
        id: col(row, "id")?,
        event_id: col(row, "event_id")?,
        event_kind: EventKind::parse(&kind)?,
        member_id: col(row, "member_id")?,
        unit_id: col(row, "unit_id")?,
        district_id: col(row, "district_id")?,
        chest_number: col(row, "chest_number")?,
        added_by: col(row, "added_by")?,
        created_at: col(row, "created_at")?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment, SabhaError> {
    let purpose: String = col(row, "purpose")?;
    let status: String = col(row, "status")?;
    Ok(Payment {
        id: col(row, "id")?,
        district_id: col(row, "district_id")?,
        purpose: PaymentPurpose::parse(&purpose)?,
        individual_count: count_from_db(col(row, "individual_count")?, "individual_count")?,
        group_count: count_from_db(col(row, "group_count")?, "group_count")?,
        computed_amount: count_from_db(col(row, "computed_amount")?, "computed_amount")?,
        status: PaymentStatus::parse(&status)?,
        proof_reference: col(row, "proof_reference")?,
        paid_by: col(row, "paid_by")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn appeal_from_row(row: &PgRow) -> Result<Appeal, SabhaError> {
    let status: String = col(row, "status")?;
    Ok(Appeal {
        id: col(row, "id")?,
        chest_number: col(row, "chest_number")?,
        event_name: col(row, "event_name")?,
        statement: col(row, "statement")?,
        reply: col(row, "reply")?,
        score_published_at: col(row, "score_published_at")?,
        status: AppealStatus::parse(&status)?,
        submitted_by: col(row, "submitted_by")?,
        created_at: col(row, "created_at")?,
    })
}

fn parse_request_kind(value: &str) -> Result<RequestKind, SabhaError> {
    match value {
        "member_transfer" => Ok(RequestKind::MemberTransfer),
        "member_info_change" => Ok(RequestKind::MemberInfoChange),
        "officials_change" => Ok(RequestKind::OfficialsChange),
        "councilor_change" => Ok(RequestKind::CouncilorChange),
        "member_addition" => Ok(RequestKind::MemberAddition),
        other => Err(SabhaError::Storage(format!(
            "unknown request kind '{other}' in postgres"
        ))),
    }
}

const RESERVE_SQL: &str = r#"
    UPDATE sabha_capacity_pools
    SET current_count = current_count + $2
    WHERE scope_key = $1
      AND current_count + $2 >= minimum_allowed
      AND current_count + $2 <= maximum_allowed
    RETURNING current_count
    "#;

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, SabhaError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres connect failed: {e}")))?;

        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), SabhaError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS sabha_targets (
                target_key TEXT PRIMARY KEY,
                entity TEXT NOT NULL,
                id UUID NOT NULL,
                fields JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sabha_change_requests (
                id UUID PRIMARY KEY,
                kind TEXT NOT NULL,
                target_entity TEXT NULL,
                target_id UUID NULL,
                created_entity TEXT NULL,
                created_id UUID NULL,
                proposed JSONB NOT NULL,
                original JSONB NOT NULL,
                capacity_demand JSONB NULL,
                reason TEXT NOT NULL,
                proof_reference TEXT NULL,
                status TEXT NOT NULL,
                submitted_by TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_sabha_requests_status ON sabha_change_requests (status)",
            r#"
            CREATE TABLE IF NOT EXISTS sabha_capacity_pools (
                scope_key TEXT PRIMARY KEY,
                current_count BIGINT NOT NULL,
                minimum_allowed BIGINT NOT NULL,
                maximum_allowed BIGINT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sabha_sequences (
                scope_key TEXT PRIMARY KEY,
                value BIGINT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sabha_teams (
                event_id UUID NOT NULL,
                unit_id UUID NOT NULL,
                chest_number TEXT NOT NULL,
                PRIMARY KEY (event_id, unit_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sabha_participations (
                id UUID PRIMARY KEY,
                event_id UUID NOT NULL,
                event_kind TEXT NOT NULL,
                member_id UUID NOT NULL,
                unit_id UUID NOT NULL,
                district_id UUID NOT NULL,
                chest_number TEXT NOT NULL,
                added_by TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_sabha_participations_member ON sabha_participations (member_id)",
            "CREATE INDEX IF NOT EXISTS idx_sabha_participations_event_unit ON sabha_participations (event_id, unit_id)",
            r#"
            CREATE TABLE IF NOT EXISTS sabha_payments (
                id UUID PRIMARY KEY,
                district_id UUID NOT NULL,
                purpose TEXT NOT NULL,
                individual_count BIGINT NOT NULL,
                group_count BIGINT NOT NULL,
                computed_amount BIGINT NOT NULL,
                status TEXT NOT NULL,
                proof_reference TEXT NULL,
                paid_by TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_sabha_payments_district ON sabha_payments (district_id, status)",
            r#"
            CREATE TABLE IF NOT EXISTS sabha_appeals (
                id UUID PRIMARY KEY,
                chest_number TEXT NOT NULL,
                event_name TEXT NOT NULL,
                statement TEXT NOT NULL,
                reply TEXT NULL,
                score_published_at TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL,
                submitted_by TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (chest_number, event_name)
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| SabhaError::Storage(format!("postgres schema create failed: {e}")))?;
        }

        Ok(())
    }

    /// Diagnose a conditional pool update that matched nothing: either the
    /// pool does not exist or the change would break its bounds. Read after
    /// the enclosing transaction rolled back, so the pool is unchanged.
    async fn pool_denied(&self, scope: &PoolScope, delta: i64) -> SabhaError {
        match self.fetch_pool(scope).await {
            Err(err) => err,
            Ok(None) => SabhaError::NotFound(format!("capacity pool '{}'", scope.key())),
            Ok(Some(pool)) => SabhaError::CapacityExceeded {
                scope: pool.scope_key,
                current: pool.current_count,
                limit: if delta >= 0 {
                    pool.maximum_allowed
                } else {
                    pool.minimum_allowed
                },
            },
        }
    }

    /// Merge `values` into the target's field map within `tx`.
    async fn patch_target(
        tx: &mut Transaction<'_, Postgres>,
        target: &TargetRef,
        values: &FieldSnapshot,
    ) -> Result<(), SabhaError> {
        let patch = serde_json::to_value(values)
            .map_err(|e| SabhaError::Serialization(format!("field patch encode failed: {e}")))?;
        let result =
            sqlx::query("UPDATE sabha_targets SET fields = fields || $2 WHERE target_key = $1")
                .bind(target.key())
                .bind(patch)
                .execute(&mut **tx)
                .await
                .map_err(|e| SabhaError::Storage(format!("postgres target update failed: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(SabhaError::NotFound(format!("target '{}'", target.key())));
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for PostgresStore {
    async fn read_fields(
        &self,
        target: &TargetRef,
        fields: &[String],
    ) -> Result<FieldSnapshot, SabhaError> {
        let row = sqlx::query("SELECT fields FROM sabha_targets WHERE target_key = $1")
            .bind(target.key())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres target read failed: {e}")))?
            .ok_or_else(|| SabhaError::NotFound(format!("target '{}'", target.key())))?;

        let stored = snapshot_from_value(col(&row, "fields")?, "target")?;
        select_fields(&stored, target, fields)
    }

    async fn insert_request_with_snapshot(
        &self,
        mut request: ChangeRequest,
    ) -> Result<ChangeRequest, SabhaError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres begin failed: {e}")))?;

        if let Some(target) = &request.target {
            // Row lock holds the target still while its fields are copied
            // into the snapshot.
            let row =
                sqlx::query("SELECT fields FROM sabha_targets WHERE target_key = $1 FOR UPDATE")
                    .bind(target.key())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| SabhaError::Storage(format!("postgres target lock failed: {e}")))?
                    .ok_or_else(|| SabhaError::NotFound(format!("target '{}'", target.key())))?;

            let stored = snapshot_from_value(col(&row, "fields")?, "target")?;
            request.diff.original =
                select_fields(&stored, target, &request.diff.proposed_fields())?;
            request.diff.verify_snapshot_complete()?;
        }

        let proposed = serde_json::to_value(&request.diff.proposed)
            .map_err(|e| SabhaError::Serialization(format!("proposed encode failed: {e}")))?;
        let original = serde_json::to_value(&request.diff.original)
            .map_err(|e| SabhaError::Serialization(format!("original encode failed: {e}")))?;
        let demand = request
            .capacity_demand
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| SabhaError::Serialization(format!("capacity demand encode failed: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO sabha_change_requests (
                id, kind, target_entity, target_id, created_entity, created_id,
                proposed, original, capacity_demand, reason, proof_reference,
                status, submitted_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(request.id)
        .bind(request.kind.name())
        .bind(request.target.map(|t| t.entity.name()))
        .bind(request.target.map(|t| t.id))
        .bind(request.created_target.map(|t| t.entity.name()))
        .bind(request.created_target.map(|t| t.id))
        .bind(proposed)
        .bind(original)
        .bind(demand)
        .bind(&request.reason)
        .bind(&request.proof_reference)
        .bind(request.status.name())
        .bind(&request.submitted_by)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| SabhaError::Storage(format!("postgres request insert failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres commit failed: {e}")))?;

        Ok(request)
    }

    async fn fetch_request(&self, id: Uuid) -> Result<ChangeRequest, SabhaError> {
        let row = sqlx::query("SELECT * FROM sabha_change_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres request read failed: {e}")))?
            .ok_or_else(|| SabhaError::NotFound(format!("change request '{id}'")))?;

        request_from_row(&row)
    }

    async fn transition_request(
        &self,
        id: Uuid,
        from: RequestStatus,
        to: RequestStatus,
    ) -> Result<ChangeRequest, SabhaError> {
        if !from.permits(to) {
            return Err(SabhaError::invalid_state(to.name(), from.name()));
        }

        let row = sqlx::query(
            r#"
            UPDATE sabha_change_requests
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(from.name())
        .bind(to.name())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SabhaError::Storage(format!("postgres request transition failed: {e}")))?;

        match row {
            Some(row) => request_from_row(&row),
            None => {
                // Distinguish a missing request from a lost status race.
                let current = self.fetch_request(id).await?;
                Err(SabhaError::invalid_state(
                    from.name(),
                    current.status.name(),
                ))
            }
        }
    }

    async fn approve_request(&self, id: Uuid) -> Result<ChangeRequest, SabhaError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres begin failed: {e}")))?;

        // The row lock serializes concurrent deciders; the loser sees the
        // committed status and fails the check below.
        let row = sqlx::query("SELECT * FROM sabha_change_requests WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres request lock failed: {e}")))?
            .ok_or_else(|| SabhaError::NotFound(format!("change request '{id}'")))?;
        let mut request = request_from_row(&row)?;
        if request.status != RequestStatus::Pending {
            return Err(SabhaError::invalid_state(
                RequestStatus::Pending.name(),
                request.status.name(),
            ));
        }

        if let Some(demand) = request.capacity_demand {
            let updated = sqlx::query(RESERVE_SQL)
                .bind(demand.scope.key())
                .bind(demand.delta)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| SabhaError::Storage(format!("postgres reserve failed: {e}")))?;
            if updated.is_none() {
                drop(tx);
                return Err(self.pool_denied(&demand.scope, demand.delta).await);
            }
        }

        if request.kind.is_addition() {
            let created = TargetRef::new(EntityKind::Member, Uuid::new_v4());
            let fields = serde_json::to_value(&request.diff.proposed)
                .map_err(|e| SabhaError::Serialization(format!("target encode failed: {e}")))?;
            sqlx::query(
                "INSERT INTO sabha_targets (target_key, entity, id, fields) VALUES ($1, $2, $3, $4)",
            )
            .bind(created.key())
            .bind(created.entity.name())
            .bind(created.id)
            .bind(fields)
            .execute(&mut *tx)
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres target insert failed: {e}")))?;

            sqlx::query(
                "UPDATE sabha_change_requests SET created_entity = $2, created_id = $3 WHERE id = $1",
            )
            .bind(id)
            .bind(created.entity.name())
            .bind(created.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres request update failed: {e}")))?;
            request.created_target = Some(created);
        } else if let Some(target) = request.target {
            Self::patch_target(&mut tx, &target, &request.diff.proposed).await?;
        }

        sqlx::query(
            "UPDATE sabha_change_requests SET status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(RequestStatus::Approved.name())
        .execute(&mut *tx)
        .await
        .map_err(|e| SabhaError::Storage(format!("postgres request transition failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres commit failed: {e}")))?;

        request.status = RequestStatus::Approved;
        request.updated_at = Utc::now();
        Ok(request)
    }

    async fn revert_request(&self, id: Uuid) -> Result<ChangeRequest, SabhaError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres begin failed: {e}")))?;

        let row = sqlx::query("SELECT * FROM sabha_change_requests WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres request lock failed: {e}")))?
            .ok_or_else(|| SabhaError::NotFound(format!("change request '{id}'")))?;
        let mut request = request_from_row(&row)?;
        if request.status != RequestStatus::Approved {
            return Err(SabhaError::invalid_state(
                RequestStatus::Approved.name(),
                request.status.name(),
            ));
        }

        if let Some(demand) = request.capacity_demand {
            let updated = sqlx::query(RESERVE_SQL)
                .bind(demand.scope.key())
                .bind(-demand.delta)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| SabhaError::Storage(format!("postgres reserve failed: {e}")))?;
            if updated.is_none() {
                drop(tx);
                return Err(self.pool_denied(&demand.scope, -demand.delta).await);
            }
        }

        if let Some(created) = request.created_target {
            let result = sqlx::query("DELETE FROM sabha_targets WHERE target_key = $1")
                .bind(created.key())
                .execute(&mut *tx)
                .await
                .map_err(|e| SabhaError::Storage(format!("postgres target delete failed: {e}")))?;
            if result.rows_affected() == 0 {
                return Err(SabhaError::NotFound(format!("target '{}'", created.key())));
            }
        } else if let Some(target) = request.target {
            Self::patch_target(&mut tx, &target, &request.diff.original).await?;
        }

        sqlx::query(
            "UPDATE sabha_change_requests SET status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(RequestStatus::Reverted.name())
        .execute(&mut *tx)
        .await
        .map_err(|e| SabhaError::Storage(format!("postgres request transition failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres commit failed: {e}")))?;

        request.status = RequestStatus::Reverted;
        request.updated_at = Utc::now();
        Ok(request)
    }

    async fn list_requests(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<ChangeRequest>, SabhaError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM sabha_change_requests WHERE status = $1 ORDER BY created_at ASC",
                )
                .bind(status.name())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM sabha_change_requests ORDER BY created_at ASC")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| SabhaError::Storage(format!("postgres request list failed: {e}")))?;

        rows.iter().map(request_from_row).collect()
    }

    async fn ensure_pool(
        &self,
        scope: &PoolScope,
        minimum_allowed: i64,
        maximum_allowed: i64,
    ) -> Result<(), SabhaError> {
        sqlx::query(
            r#"
            INSERT INTO sabha_capacity_pools (scope_key, current_count, minimum_allowed, maximum_allowed)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (scope_key)
            DO UPDATE SET minimum_allowed = $3, maximum_allowed = $4
            "#,
        )
        .bind(scope.key())
        .bind(minimum_allowed.max(0))
        .bind(minimum_allowed)
        .bind(maximum_allowed)
        .execute(&self.pool)
        .await
        .map_err(|e| SabhaError::Storage(format!("postgres pool upsert failed: {e}")))?;

        Ok(())
    }

    async fn fetch_pool(&self, scope: &PoolScope) -> Result<Option<CapacityPool>, SabhaError> {
        let row = sqlx::query("SELECT * FROM sabha_capacity_pools WHERE scope_key = $1")
            .bind(scope.key())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres pool read failed: {e}")))?;

        row.map(|row| {
            Ok(CapacityPool {
                scope_key: col(&row, "scope_key")?,
                current_count: col(&row, "current_count")?,
                minimum_allowed: col(&row, "minimum_allowed")?,
                maximum_allowed: col(&row, "maximum_allowed")?,
            })
        })
        .transpose()
    }

    async fn reserve(&self, scope: &PoolScope, delta: i64) -> Result<i64, SabhaError> {
        let row = sqlx::query(RESERVE_SQL)
            .bind(scope.key())
            .bind(delta)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres reserve failed: {e}")))?;

        match row {
            Some(row) => col(&row, "current_count"),
            None => Err(self.pool_denied(scope, delta).await),
        }
    }

    async fn next_sequence(&self, scope: &SequenceScope) -> Result<u64, SabhaError> {
        let row = sqlx::query(
            r#"
            INSERT INTO sabha_sequences (scope_key, value)
            VALUES ($1, 1)
            ON CONFLICT (scope_key)
            DO UPDATE SET value = sabha_sequences.value + 1
            RETURNING value
            "#,
        )
        .bind(scope.key())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SabhaError::Storage(format!("postgres sequence failed: {e}")))?;

        count_from_db(col(&row, "value")?, "sequence value")
    }

    async fn insert_participation(
        &self,
        participation: Participation,
    ) -> Result<Participation, SabhaError> {
        sqlx::query(
            r#"
            INSERT INTO sabha_participations (
                id, event_id, event_kind, member_id, unit_id, district_id,
                chest_number, added_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(participation.id)
        .bind(participation.event_id)
        .bind(participation.event_kind.name())
        .bind(participation.member_id)
        .bind(participation.unit_id)
        .bind(participation.district_id)
        .bind(&participation.chest_number)
        .bind(&participation.added_by)
        .bind(participation.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SabhaError::Storage(format!("postgres participation insert failed: {e}")))?;

        Ok(participation)
    }

    async fn fetch_participation(&self, id: Uuid) -> Result<Participation, SabhaError> {
        let row = sqlx::query("SELECT * FROM sabha_participations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres participation read failed: {e}")))?
            .ok_or_else(|| SabhaError::NotFound(format!("participation '{id}'")))?;

        participation_from_row(&row)
    }

    async fn delete_participation(&self, id: Uuid) -> Result<Participation, SabhaError> {
        let row = sqlx::query("DELETE FROM sabha_participations WHERE id = $1 RETURNING *")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres participation delete failed: {e}")))?
            .ok_or_else(|| SabhaError::NotFound(format!("participation '{id}'")))?;

        participation_from_row(&row)
    }

    async fn member_chest_number(&self, member_id: Uuid) -> Result<Option<String>, SabhaError> {
        let row = sqlx::query(
            r#"
            SELECT chest_number FROM sabha_participations
            WHERE member_id = $1 AND event_kind = 'individual'
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(member_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SabhaError::Storage(format!("postgres chest lookup failed: {e}")))?;

        row.map(|row| col(&row, "chest_number")).transpose()
    }

    async fn team_chest_number(
        &self,
        event_id: Uuid,
        unit_id: Uuid,
    ) -> Result<Option<String>, SabhaError> {
        let row = sqlx::query(
            "SELECT chest_number FROM sabha_teams WHERE event_id = $1 AND unit_id = $2",
        )
        .bind(event_id)
        .bind(unit_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SabhaError::Storage(format!("postgres team lookup failed: {e}")))?;

        row.map(|row| col(&row, "chest_number")).transpose()
    }

    async fn claim_team(
        &self,
        event_id: Uuid,
        unit_id: Uuid,
        candidate_chest: &str,
        teams_scope: &PoolScope,
    ) -> Result<String, SabhaError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres begin failed: {e}")))?;

        // The conflict target makes concurrent first claims serialize on the
        // primary key: the loser's insert returns nothing and it reads the
        // winner's chest number instead.
        let inserted = sqlx::query(
            r#"
            INSERT INTO sabha_teams (event_id, unit_id, chest_number)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id, unit_id) DO NOTHING
            RETURNING chest_number
            "#,
        )
        .bind(event_id)
        .bind(unit_id)
        .bind(candidate_chest)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| SabhaError::Storage(format!("postgres team claim failed: {e}")))?;

        if inserted.is_some() {
            let updated = sqlx::query(RESERVE_SQL)
                .bind(teams_scope.key())
                .bind(1_i64)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| SabhaError::Storage(format!("postgres reserve failed: {e}")))?;
            if updated.is_none() {
                drop(tx);
                return Err(self.pool_denied(teams_scope, 1).await);
            }
            tx.commit()
                .await
                .map_err(|e| SabhaError::Storage(format!("postgres commit failed: {e}")))?;
            return Ok(candidate_chest.to_string());
        }

        tx.commit()
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres commit failed: {e}")))?;

        let row = sqlx::query(
            "SELECT chest_number FROM sabha_teams WHERE event_id = $1 AND unit_id = $2",
        )
        .bind(event_id)
        .bind(unit_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SabhaError::Storage(format!("postgres team lookup failed: {e}")))?;
        col(&row, "chest_number")
    }

    async fn dissolve_team(&self, event_id: Uuid, unit_id: Uuid) -> Result<(), SabhaError> {
        sqlx::query("DELETE FROM sabha_teams WHERE event_id = $1 AND unit_id = $2")
            .bind(event_id)
            .bind(unit_id)
            .execute(&self.pool)
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres team delete failed: {e}")))?;
        Ok(())
    }

    async fn insert_payment(&self, payment: Payment) -> Result<Payment, SabhaError> {
        sqlx::query(
            r#"
            INSERT INTO sabha_payments (
                id, district_id, purpose, individual_count, group_count,
                computed_amount, status, proof_reference, paid_by,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(payment.id)
        .bind(payment.district_id)
        .bind(payment.purpose.name())
        .bind(count_to_db(payment.individual_count, "individual_count")?)
        .bind(count_to_db(payment.group_count, "group_count")?)
        .bind(count_to_db(payment.computed_amount, "computed_amount")?)
        .bind(payment.status.name())
        .bind(&payment.proof_reference)
        .bind(&payment.paid_by)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SabhaError::Storage(format!("postgres payment insert failed: {e}")))?;

        Ok(payment)
    }

    async fn fetch_payment(&self, id: Uuid) -> Result<Payment, SabhaError> {
        let row = sqlx::query("SELECT * FROM sabha_payments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres payment read failed: {e}")))?
            .ok_or_else(|| SabhaError::NotFound(format!("payment '{id}'")))?;

        payment_from_row(&row)
    }

    async fn open_payment_for_district(
        &self,
        district_id: Uuid,
        purpose: PaymentPurpose,
    ) -> Result<Option<Payment>, SabhaError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM sabha_payments
            WHERE district_id = $1 AND purpose = $2 AND status IN ('pending', 'proof_uploaded')
            LIMIT 1
            "#,
        )
        .bind(district_id)
        .bind(purpose.name())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SabhaError::Storage(format!("postgres payment read failed: {e}")))?;

        row.map(|row| payment_from_row(&row)).transpose()
    }

    async fn update_payment(&self, payment: &Payment) -> Result<(), SabhaError> {
        let result = sqlx::query(
            r#"
            UPDATE sabha_payments
            SET individual_count = $2, group_count = $3, computed_amount = $4,
                status = $5, proof_reference = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(payment.id)
        .bind(count_to_db(payment.individual_count, "individual_count")?)
        .bind(count_to_db(payment.group_count, "group_count")?)
        .bind(count_to_db(payment.computed_amount, "computed_amount")?)
        .bind(payment.status.name())
        .bind(&payment.proof_reference)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SabhaError::Storage(format!("postgres payment update failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(SabhaError::NotFound(format!("payment '{}'", payment.id)));
        }
        Ok(())
    }

    async fn insert_appeal(&self, appeal: Appeal) -> Result<Appeal, SabhaError> {
        sqlx::query(
            r#"
            INSERT INTO sabha_appeals (
                id, chest_number, event_name, statement, reply,
                score_published_at, status, submitted_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(appeal.id)
        .bind(&appeal.chest_number)
        .bind(&appeal.event_name)
        .bind(&appeal.statement)
        .bind(&appeal.reply)
        .bind(appeal.score_published_at)
        .bind(appeal.status.name())
        .bind(&appeal.submitted_by)
        .bind(appeal.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SabhaError::Storage(format!("postgres appeal insert failed: {e}")))?;

        Ok(appeal)
    }

    async fn fetch_appeal(&self, id: Uuid) -> Result<Appeal, SabhaError> {
        let row = sqlx::query("SELECT * FROM sabha_appeals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SabhaError::Storage(format!("postgres appeal read failed: {e}")))?
            .ok_or_else(|| SabhaError::NotFound(format!("appeal '{id}'")))?;

        appeal_from_row(&row)
    }

    async fn appeal_exists(
        &self,
        chest_number: &str,
        event_name: &str,
    ) -> Result<bool, SabhaError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM sabha_appeals WHERE chest_number = $1 AND event_name = $2)",
        )
        .bind(chest_number)
        .bind(event_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SabhaError::Storage(format!("postgres appeal lookup failed: {e}")))?;

        row.try_get::<bool, _>(0)
            .map_err(|e| SabhaError::Storage(format!("postgres decode exists failed: {e}")))
    }

    async fn update_appeal(&self, appeal: &Appeal) -> Result<(), SabhaError> {
        let result = sqlx::query(
            "UPDATE sabha_appeals SET reply = $2, status = $3 WHERE id = $1",
        )
        .bind(appeal.id)
        .bind(&appeal.reply)
        .bind(appeal.status.name())
        .execute(&self.pool)
        .await
        .map_err(|e| SabhaError::Storage(format!("postgres appeal update failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(SabhaError::NotFound(format!("appeal '{}'", appeal.id)));
        }
        Ok(())
    }
}

fn select_fields(
    stored: &FieldSnapshot,
    target: &TargetRef,
    fields: &[String],
) -> Result<FieldSnapshot, SabhaError> {
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
