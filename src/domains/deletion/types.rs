//! Type definitions for the cascade delete engine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::domains::entity::types::{parse_datetime, parse_uuid};
use crate::errors::{DomainError, DomainResult, ValidationError};

/// Lifecycle state of a delete operation.
///
/// Progression is monotonic: `Pending -> InProgress -> terminal`. The only
/// backward edge is an explicit retry, which moves `Failed` or `Partial`
/// back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Completed => "completed",
            OperationStatus::Partial => "partial",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed
                | OperationStatus::Partial
                | OperationStatus::Failed
                | OperationStatus::Cancelled
        )
    }

    /// Active states count against the per-principal concurrency cap.
    pub fn is_active(&self) -> bool {
        matches!(self, OperationStatus::Pending | OperationStatus::InProgress)
    }
}

impl FromStr for OperationStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "in_progress" => Ok(OperationStatus::InProgress),
            "completed" => Ok(OperationStatus::Completed),
            "partial" => Ok(OperationStatus::Partial),
            "failed" => Ok(OperationStatus::Failed),
            "cancelled" => Ok(OperationStatus::Cancelled),
            _ => Err(DomainError::Validation(ValidationError::custom(&format!(
                "Invalid operation status: {}",
                s
            )))),
        }
    }
}

/// Snapshot of a finished attempt, preserved when the operation is retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAuditEntry {
    pub status: OperationStatus,
    pub total_entities: i64,
    pub deleted_count: i64,
    pub failed_count: i64,
    pub failed_entity_ids: Vec<Uuid>,
    pub error_details: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retried_at: DateTime<Utc>,
    pub retried_by: Uuid,
}

/// A durable record of one cascade-delete request and its progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOperation {
    pub id: Uuid,
    pub world_id: Uuid,
    pub root_entity_id: Uuid,
    /// Display name snapshotted at admission, for progress reporting.
    pub root_entity_name: String,
    pub cascade: bool,
    pub status: OperationStatus,
    /// Root plus descendants the operation will attempt; 0 until claimed.
    pub total_entities: i64,
    pub deleted_count: i64,
    pub failed_count: i64,
    /// Bounded sample of failed entity ids; overflow only bumps the counter.
    pub failed_entity_ids: Vec<Uuid>,
    pub error_details: Option<String>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub ttl_expires_at: Option<DateTime<Utc>>,
    /// The scheduler's compare-and-swap token; refreshed on every checkpoint.
    pub last_heartbeat: DateTime<Utc>,
    pub cancel_requested: bool,
    pub retry_history: Vec<RetryAuditEntry>,
}

impl DeleteOperation {
    pub fn new(
        world_id: Uuid,
        root_entity_id: Uuid,
        root_entity_name: String,
        cascade: bool,
        created_by: Uuid,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            world_id,
            root_entity_id,
            root_entity_name,
            cascade,
            status: OperationStatus::Pending,
            total_entities: 0,
            deleted_count: 0,
            failed_count: 0,
            failed_entity_ids: Vec::new(),
            error_details: None,
            created_by,
            created_at: now,
            started_at: None,
            completed_at: None,
            ttl_expires_at: None,
            last_heartbeat: now,
            cancel_requested: false,
            retry_history: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Engine configuration, supplied once at process start. No hot reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteEngineConfig {
    /// Hard cap on `pending | in_progress` operations per principal per
    /// world; admission beyond it is rejected.
    pub max_concurrent_per_principal_per_world: i64,
    /// Retry-After hint returned alongside a rate-limit rejection.
    pub retry_after_seconds: u64,
    /// Entities soft-deleted between checkpoints.
    pub batch_size: usize,
    /// Scheduler tick.
    pub poll_interval_ms: u64,
    /// Terminal records are removed this long after completion.
    pub operation_ttl_hours: i64,
    /// Cap on ids recorded in `failed_entity_ids`.
    pub max_failed_entity_ids: usize,
    /// Retries per entity on transient backend errors.
    pub soft_delete_retries: usize,
    /// Backoff before each transient retry, in order.
    pub retry_backoff_ms: Vec<u64>,
    /// Operations processed concurrently per scheduler instance.
    pub worker_count: usize,
}

impl Default for DeleteEngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_principal_per_world: 5,
            retry_after_seconds: 30,
            batch_size: 50,
            poll_interval_ms: 2000,
            operation_ttl_hours: 24,
            max_failed_entity_ids: 100,
            soft_delete_retries: 3,
            retry_backoff_ms: vec![50, 200, 1000],
            worker_count: 4,
        }
    }
}

/// DeleteOperationRow - SQLite row representation for mapping from database
#[derive(Debug, Clone, FromRow)]
pub struct DeleteOperationRow {
    pub id: String,
    pub world_id: String,
    pub root_entity_id: String,
    pub root_entity_name: String,
    pub cascade_delete: i64,
    pub status: String,
    pub total_entities: i64,
    pub deleted_count: i64,
    pub failed_count: i64,
    pub failed_entity_ids: String,
    pub error_details: Option<String>,
    pub created_by: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub ttl_expires_at: Option<String>,
    pub last_heartbeat: String,
    pub cancel_requested: i64,
    pub retry_history: String,
}

impl DeleteOperationRow {
    pub fn into_operation(self) -> DomainResult<DeleteOperation> {
        let failed_entity_ids: Vec<Uuid> = serde_json::from_str(&self.failed_entity_ids)
            .map_err(|e| DomainError::Internal(format!("invalid failed_entity_ids: {}", e)))?;
        let retry_history: Vec<RetryAuditEntry> = serde_json::from_str(&self.retry_history)
            .map_err(|e| DomainError::Internal(format!("invalid retry_history: {}", e)))?;

        Ok(DeleteOperation {
            id: parse_uuid("id", &self.id)?,
            world_id: parse_uuid("world_id", &self.world_id)?,
            root_entity_id: parse_uuid("root_entity_id", &self.root_entity_id)?,
            root_entity_name: self.root_entity_name,
            cascade: self.cascade_delete != 0,
            status: self.status.parse()?,
            total_entities: self.total_entities,
            deleted_count: self.deleted_count,
            failed_count: self.failed_count,
            failed_entity_ids,
            error_details: self.error_details,
            created_by: parse_uuid("created_by", &self.created_by)?,
            created_at: parse_datetime("created_at", &self.created_at)?,
            started_at: self
                .started_at
                .as_deref()
                .map(|s| parse_datetime("started_at", s))
                .transpose()?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(|s| parse_datetime("completed_at", s))
                .transpose()?,
            ttl_expires_at: self
                .ttl_expires_at
                .as_deref()
                .map(|s| parse_datetime("ttl_expires_at", s))
                .transpose()?,
            last_heartbeat: parse_datetime("last_heartbeat", &self.last_heartbeat)?,
            cancel_requested: self.cancel_requested != 0,
            retry_history,
        })
    }
}
