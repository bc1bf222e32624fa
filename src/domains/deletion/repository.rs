use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, query_scalar, SqlitePool};
use uuid::Uuid;

use crate::domains::deletion::types::{
    DeleteOperation, DeleteOperationRow, OperationStatus, RetryAuditEntry,
};
use crate::errors::{DbError, DomainError, DomainResult};

/// Durable, partitioned record of delete operations.
///
/// Status transitions are serialized through compare-and-swap: the scheduler
/// claims with a status guard and checkpoints with a heartbeat guard, so
/// multiple scheduler processes can coexist without a single-writer
/// assumption. `cancel_requested` has exactly one writer path
/// ([`request_cancel`](OperationLogRepository::request_cancel)); bulk updates
/// never touch it, which is what keeps a concurrent cancel from being lost
/// under a checkpoint race.
///
/// Terminal records expire `ttl_expires_at` after completion. Reads treat
/// expired rows as absent even before the sweep removes them; an expired
/// record is never resurrected.
#[async_trait]
pub trait OperationLogRepository: Send + Sync {
    /// Persist a new operation. Rejects a duplicate id.
    async fn create(&self, op: &DeleteOperation) -> DomainResult<DeleteOperation>;

    async fn find_by_id(&self, world_id: Uuid, op_id: Uuid) -> DomainResult<DeleteOperation>;

    /// Whole-record replace guarded by CAS on `last_heartbeat` (the guard is
    /// the caller's last observed value; `op.last_heartbeat` carries the new
    /// one). `cancel_requested` is deliberately not written. Returns the
    /// stored record, including the current cancel flag.
    async fn update(
        &self,
        op: &DeleteOperation,
        expected_heartbeat: DateTime<Utc>,
    ) -> DomainResult<DeleteOperation>;

    /// CAS `pending -> in_progress`, stamping `started_at` and the
    /// heartbeat. `None` means another scheduler won the claim.
    async fn try_claim(
        &self,
        world_id: Uuid,
        op_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> DomainResult<Option<DeleteOperation>>;

    /// Set `cancel_requested` on a `pending` or `in_progress` operation.
    async fn request_cancel(&self, world_id: Uuid, op_id: Uuid) -> DomainResult<DeleteOperation>;

    /// Move a `failed` or `partial` operation back to `pending`, zeroing the
    /// counters so the next claim re-enumerates the tree, and appending the
    /// prior attempt to the retry audit history.
    async fn reset_for_retry(
        &self,
        world_id: Uuid,
        op_id: Uuid,
        retried_by: Uuid,
    ) -> DomainResult<DeleteOperation>;

    /// Most recent non-expired operations in a world, `created_at` descending.
    async fn list_recent_by_world(
        &self,
        world_id: Uuid,
        limit: i64,
    ) -> DomainResult<Vec<DeleteOperation>>;

    /// Operations in `pending | in_progress` created by the principal.
    async fn count_active_by_principal(
        &self,
        world_id: Uuid,
        principal_id: Uuid,
    ) -> DomainResult<i64>;

    /// Cross-world scan used by the scheduler's claim loop.
    async fn list_pending(&self) -> DomainResult<Vec<DeleteOperation>>;

    /// Cross-world scan used by the scheduler's restart recovery.
    async fn list_in_progress(&self) -> DomainResult<Vec<DeleteOperation>>;

    /// Remove records whose TTL has elapsed. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> DomainResult<u64>;
}

/// SQLite implementation for OperationLogRepository
#[derive(Debug, Clone)]
pub struct SqliteOperationLogRepository {
    pool: SqlitePool,
}

impl SqliteOperationLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, world_id: Uuid, op_id: Uuid) -> DomainResult<DeleteOperation> {
        let row = query_as::<_, DeleteOperationRow>(
            "SELECT * FROM delete_operations
             WHERE world_id = ? AND id = ?
               AND (ttl_expires_at IS NULL OR ttl_expires_at > ?)",
        )
        .bind(world_id.to_string())
        .bind(op_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?
        .ok_or(DomainError::OperationNotFound(op_id))?;

        row.into_operation()
    }

    async fn list_by_status(&self, status: OperationStatus) -> DomainResult<Vec<DeleteOperation>> {
        let rows = query_as::<_, DeleteOperationRow>(
            "SELECT * FROM delete_operations WHERE status = ? ORDER BY created_at ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(|row| row.into_operation()).collect()
    }

    fn encode_failed_ids(op: &DeleteOperation) -> DomainResult<String> {
        serde_json::to_string(&op.failed_entity_ids)
            .map_err(|e| DomainError::Internal(format!("failed to encode failed ids: {}", e)))
    }

    fn encode_retry_history(history: &[RetryAuditEntry]) -> DomainResult<String> {
        serde_json::to_string(history)
            .map_err(|e| DomainError::Internal(format!("failed to encode retry history: {}", e)))
    }
}

#[async_trait]
impl OperationLogRepository for SqliteOperationLogRepository {
    async fn create(&self, op: &DeleteOperation) -> DomainResult<DeleteOperation> {
        query(
            "INSERT INTO delete_operations (
                id, world_id, root_entity_id, root_entity_name, cascade_delete,
                status, total_entities, deleted_count, failed_count,
                failed_entity_ids, error_details, created_by, created_at,
                started_at, completed_at, ttl_expires_at, last_heartbeat,
                cancel_requested, retry_history
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(op.id.to_string())
        .bind(op.world_id.to_string())
        .bind(op.root_entity_id.to_string())
        .bind(&op.root_entity_name)
        .bind(op.cascade as i64)
        .bind(op.status.as_str())
        .bind(op.total_entities)
        .bind(op.deleted_count)
        .bind(op.failed_count)
        .bind(Self::encode_failed_ids(op)?)
        .bind(&op.error_details)
        .bind(op.created_by.to_string())
        .bind(op.created_at.to_rfc3339())
        .bind(op.started_at.map(|t| t.to_rfc3339()))
        .bind(op.completed_at.map(|t| t.to_rfc3339()))
        .bind(op.ttl_expires_at.map(|t| t.to_rfc3339()))
        .bind(op.last_heartbeat.to_rfc3339())
        .bind(op.cancel_requested as i64)
        .bind(Self::encode_retry_history(&op.retry_history)?)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation()) {
                DbError::Conflict(format!("delete operation {} already exists", op.id))
            } else {
                DbError::from(e)
            }
        })?;

        Ok(op.clone())
    }

    async fn find_by_id(&self, world_id: Uuid, op_id: Uuid) -> DomainResult<DeleteOperation> {
        self.fetch(world_id, op_id).await
    }

    async fn update(
        &self,
        op: &DeleteOperation,
        expected_heartbeat: DateTime<Utc>,
    ) -> DomainResult<DeleteOperation> {
        let result = query(
            "UPDATE delete_operations SET
                status = ?, total_entities = ?, deleted_count = ?,
                failed_count = ?, failed_entity_ids = ?, error_details = ?,
                started_at = ?, completed_at = ?, ttl_expires_at = ?,
                last_heartbeat = ?, retry_history = ?
             WHERE world_id = ? AND id = ? AND last_heartbeat = ?",
        )
        .bind(op.status.as_str())
        .bind(op.total_entities)
        .bind(op.deleted_count)
        .bind(op.failed_count)
        .bind(Self::encode_failed_ids(op)?)
        .bind(&op.error_details)
        .bind(op.started_at.map(|t| t.to_rfc3339()))
        .bind(op.completed_at.map(|t| t.to_rfc3339()))
        .bind(op.ttl_expires_at.map(|t| t.to_rfc3339()))
        .bind(op.last_heartbeat.to_rfc3339())
        .bind(Self::encode_retry_history(&op.retry_history)?)
        .bind(op.world_id.to_string())
        .bind(op.id.to_string())
        .bind(expected_heartbeat.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            // Distinguish a lost CAS from a vanished record.
            self.fetch(op.world_id, op.id).await?;
            return Err(DomainError::VersionConflict(
                "DeleteOperation".to_string(),
                op.id,
            ));
        }

        self.fetch(op.world_id, op.id).await
    }

    async fn try_claim(
        &self,
        world_id: Uuid,
        op_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> DomainResult<Option<DeleteOperation>> {
        let result = query(
            "UPDATE delete_operations
             SET status = 'in_progress', started_at = ?, last_heartbeat = ?
             WHERE world_id = ? AND id = ? AND status = 'pending'",
        )
        .bind(started_at.to_rfc3339())
        .bind(started_at.to_rfc3339())
        .bind(world_id.to_string())
        .bind(op_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(self.fetch(world_id, op_id).await?))
    }

    async fn request_cancel(&self, world_id: Uuid, op_id: Uuid) -> DomainResult<DeleteOperation> {
        let result = query(
            "UPDATE delete_operations SET cancel_requested = 1
             WHERE world_id = ? AND id = ? AND status IN ('pending', 'in_progress')",
        )
        .bind(world_id.to_string())
        .bind(op_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            let current = self.fetch(world_id, op_id).await?;
            return Err(DomainError::InvalidStatusTransition {
                id: op_id,
                current: current.status.as_str().to_string(),
                expected: "pending, in_progress".to_string(),
            });
        }
        self.fetch(world_id, op_id).await
    }

    async fn reset_for_retry(
        &self,
        world_id: Uuid,
        op_id: Uuid,
        retried_by: Uuid,
    ) -> DomainResult<DeleteOperation> {
        let current = self.fetch(world_id, op_id).await?;
        if !matches!(
            current.status,
            OperationStatus::Failed | OperationStatus::Partial
        ) {
            return Err(DomainError::InvalidStatusTransition {
                id: op_id,
                current: current.status.as_str().to_string(),
                expected: "failed, partial".to_string(),
            });
        }

        let now = Utc::now();
        let mut history = current.retry_history.clone();
        history.push(RetryAuditEntry {
            status: current.status,
            total_entities: current.total_entities,
            deleted_count: current.deleted_count,
            failed_count: current.failed_count,
            failed_entity_ids: current.failed_entity_ids.clone(),
            error_details: current.error_details.clone(),
            started_at: current.started_at,
            completed_at: current.completed_at,
            retried_at: now,
            retried_by,
        });

        let result = query(
            "UPDATE delete_operations SET
                status = 'pending', total_entities = 0, deleted_count = 0,
                failed_count = 0, failed_entity_ids = '[]', error_details = NULL,
                started_at = NULL, completed_at = NULL, ttl_expires_at = NULL,
                cancel_requested = 0, last_heartbeat = ?, retry_history = ?
             WHERE world_id = ? AND id = ? AND status IN ('failed', 'partial')",
        )
        .bind(now.to_rfc3339())
        .bind(Self::encode_retry_history(&history)?)
        .bind(world_id.to_string())
        .bind(op_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            // Lost a race with another retry or a concurrent transition.
            let current = self.fetch(world_id, op_id).await?;
            return Err(DomainError::InvalidStatusTransition {
                id: op_id,
                current: current.status.as_str().to_string(),
                expected: "failed, partial".to_string(),
            });
        }
        self.fetch(world_id, op_id).await
    }

    async fn list_recent_by_world(
        &self,
        world_id: Uuid,
        limit: i64,
    ) -> DomainResult<Vec<DeleteOperation>> {
        let rows = query_as::<_, DeleteOperationRow>(
            "SELECT * FROM delete_operations
             WHERE world_id = ? AND (ttl_expires_at IS NULL OR ttl_expires_at > ?)
             ORDER BY created_at DESC
             LIMIT ?",
        )
        .bind(world_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(|row| row.into_operation()).collect()
    }

    async fn count_active_by_principal(
        &self,
        world_id: Uuid,
        principal_id: Uuid,
    ) -> DomainResult<i64> {
        let count: i64 = query_scalar(
            "SELECT COUNT(*) FROM delete_operations
             WHERE world_id = ? AND created_by = ?
               AND status IN ('pending', 'in_progress')",
        )
        .bind(world_id.to_string())
        .bind(principal_id.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(count)
    }

    async fn list_pending(&self) -> DomainResult<Vec<DeleteOperation>> {
        self.list_by_status(OperationStatus::Pending).await
    }

    async fn list_in_progress(&self) -> DomainResult<Vec<DeleteOperation>> {
        self.list_by_status(OperationStatus::InProgress).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> DomainResult<u64> {
        let result = query(
            "DELETE FROM delete_operations
             WHERE ttl_expires_at IS NOT NULL AND ttl_expires_at <= ?",
        )
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(result.rows_affected())
    }
}
