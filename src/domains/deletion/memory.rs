//! In-memory operation log for tests and embedder harnesses.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domains::deletion::repository::OperationLogRepository;
use crate::domains::deletion::types::{DeleteOperation, OperationStatus, RetryAuditEntry};
use crate::errors::{DbError, DomainError, DomainResult};

/// HashMap-backed implementation of [`OperationLogRepository`] with the same
/// CAS and TTL-visibility semantics as the durable store. All transitions
/// happen under one write lock, which makes the compare-and-swap atomic.
#[derive(Debug, Default)]
pub struct InMemoryOperationLogRepository {
    operations: RwLock<HashMap<(Uuid, Uuid), DeleteOperation>>,
}

impl InMemoryOperationLogRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn expired(op: &DeleteOperation, now: DateTime<Utc>) -> bool {
        op.ttl_expires_at.is_some_and(|t| t <= now)
    }
}

#[async_trait]
impl OperationLogRepository for InMemoryOperationLogRepository {
    async fn create(&self, op: &DeleteOperation) -> DomainResult<DeleteOperation> {
        let mut operations = self.operations.write().await;
        let key = (op.world_id, op.id);
        if operations.contains_key(&key) {
            return Err(
                DbError::Conflict(format!("delete operation {} already exists", op.id)).into(),
            );
        }
        operations.insert(key, op.clone());
        Ok(op.clone())
    }

    async fn find_by_id(&self, world_id: Uuid, op_id: Uuid) -> DomainResult<DeleteOperation> {
        self.operations
            .read()
            .await
            .get(&(world_id, op_id))
            .filter(|op| !Self::expired(op, Utc::now()))
            .cloned()
            .ok_or(DomainError::OperationNotFound(op_id))
    }

    async fn update(
        &self,
        op: &DeleteOperation,
        expected_heartbeat: DateTime<Utc>,
    ) -> DomainResult<DeleteOperation> {
        let mut operations = self.operations.write().await;
        let stored = operations
            .get_mut(&(op.world_id, op.id))
            .filter(|stored| !Self::expired(stored, Utc::now()))
            .ok_or(DomainError::OperationNotFound(op.id))?;

        if stored.last_heartbeat != expected_heartbeat {
            return Err(DomainError::VersionConflict(
                "DeleteOperation".to_string(),
                op.id,
            ));
        }

        // Whole-record replace except the cancel flag, which has its own
        // single writer path.
        let cancel_requested = stored.cancel_requested;
        *stored = op.clone();
        stored.cancel_requested = cancel_requested;
        Ok(stored.clone())
    }

    async fn try_claim(
        &self,
        world_id: Uuid,
        op_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> DomainResult<Option<DeleteOperation>> {
        let mut operations = self.operations.write().await;
        let Some(stored) = operations.get_mut(&(world_id, op_id)) else {
            return Ok(None);
        };
        if stored.status != OperationStatus::Pending {
            return Ok(None);
        }
        stored.status = OperationStatus::InProgress;
        stored.started_at = Some(started_at);
        stored.last_heartbeat = started_at;
        Ok(Some(stored.clone()))
    }

    async fn request_cancel(&self, world_id: Uuid, op_id: Uuid) -> DomainResult<DeleteOperation> {
        let mut operations = self.operations.write().await;
        let stored = operations
            .get_mut(&(world_id, op_id))
            .filter(|stored| !Self::expired(stored, Utc::now()))
            .ok_or(DomainError::OperationNotFound(op_id))?;

        if !stored.status.is_active() {
            return Err(DomainError::InvalidStatusTransition {
                id: op_id,
                current: stored.status.as_str().to_string(),
                expected: "pending, in_progress".to_string(),
            });
        }
        stored.cancel_requested = true;
        Ok(stored.clone())
    }

    async fn reset_for_retry(
        &self,
        world_id: Uuid,
        op_id: Uuid,
        retried_by: Uuid,
    ) -> DomainResult<DeleteOperation> {
        let mut operations = self.operations.write().await;
        let stored = operations
            .get_mut(&(world_id, op_id))
            .filter(|stored| !Self::expired(stored, Utc::now()))
            .ok_or(DomainError::OperationNotFound(op_id))?;

        if !matches!(
            stored.status,
            OperationStatus::Failed | OperationStatus::Partial
        ) {
            return Err(DomainError::InvalidStatusTransition {
                id: op_id,
                current: stored.status.as_str().to_string(),
                expected: "failed, partial".to_string(),
            });
        }

        let now = Utc::now();
        stored.retry_history.push(RetryAuditEntry {
            status: stored.status,
            total_entities: stored.total_entities,
            deleted_count: stored.deleted_count,
            failed_count: stored.failed_count,
            failed_entity_ids: stored.failed_entity_ids.clone(),
            error_details: stored.error_details.clone(),
            started_at: stored.started_at,
            completed_at: stored.completed_at,
            retried_at: now,
            retried_by,
        });
        stored.status = OperationStatus::Pending;
        stored.total_entities = 0;
        stored.deleted_count = 0;
        stored.failed_count = 0;
        stored.failed_entity_ids.clear();
        stored.error_details = None;
        stored.started_at = None;
        stored.completed_at = None;
        stored.ttl_expires_at = None;
        stored.cancel_requested = false;
        stored.last_heartbeat = now;
        Ok(stored.clone())
    }

    async fn list_recent_by_world(
        &self,
        world_id: Uuid,
        limit: i64,
    ) -> DomainResult<Vec<DeleteOperation>> {
        let now = Utc::now();
        let mut ops: Vec<DeleteOperation> = self
            .operations
            .read()
            .await
            .values()
            .filter(|op| op.world_id == world_id && !Self::expired(op, now))
            .cloned()
            .collect();
        ops.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        ops.truncate(limit.max(0) as usize);
        Ok(ops)
    }

    async fn count_active_by_principal(
        &self,
        world_id: Uuid,
        principal_id: Uuid,
    ) -> DomainResult<i64> {
        let count = self
            .operations
            .read()
            .await
            .values()
            .filter(|op| {
                op.world_id == world_id && op.created_by == principal_id && op.status.is_active()
            })
            .count();
        Ok(count as i64)
    }

    async fn list_pending(&self) -> DomainResult<Vec<DeleteOperation>> {
        let mut ops: Vec<DeleteOperation> = self
            .operations
            .read()
            .await
            .values()
            .filter(|op| op.status == OperationStatus::Pending)
            .cloned()
            .collect();
        ops.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(ops)
    }

    async fn list_in_progress(&self) -> DomainResult<Vec<DeleteOperation>> {
        let mut ops: Vec<DeleteOperation> = self
            .operations
            .read()
            .await
            .values()
            .filter(|op| op.status == OperationStatus::InProgress)
            .cloned()
            .collect();
        ops.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(ops)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> DomainResult<u64> {
        let mut operations = self.operations.write().await;
        let before = operations.len();
        operations.retain(|_, op| !Self::expired(op, now));
        Ok((before - operations.len()) as u64)
    }
}
