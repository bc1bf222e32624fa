//! Background scheduler that drains the operation log.
//!
//! One scheduling loop runs per process. It claims pending operations by
//! compare-and-swap, hands them to a bounded worker pool, and on startup
//! re-adopts operations a previous process left `in_progress`. Every step
//! of per-operation processing is idempotent, so a crashed or duplicated
//! run converges on the same terminal state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as TtlDuration, Utc};
use log::{debug, error, info, warn};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domains::deletion::planner::{plan_cascade, plan_single};
use crate::domains::deletion::repository::OperationLogRepository;
use crate::domains::deletion::types::{DeleteEngineConfig, DeleteOperation, OperationStatus};
use crate::domains::entity::repository::EntityRepository;
use crate::errors::{DomainError, DomainResult};

/// Outcome of one entity's delete attempt inside a batch.
enum DeleteOutcome {
    /// Soft-deleted now, or found already deleted. Both count as success.
    Deleted,
    /// Attempts exhausted; the entity goes into the failure tally.
    Failed(String),
}

/// Scheduler for processing the delete operation queue in the background.
pub struct DeleteScheduler {
    processor: Arc<OperationProcessor>,
    config: DeleteEngineConfig,
}

impl DeleteScheduler {
    pub fn new(
        entity_repo: Arc<dyn EntityRepository>,
        op_repo: Arc<dyn OperationLogRepository>,
        config: DeleteEngineConfig,
    ) -> Self {
        Self {
            processor: Arc::new(OperationProcessor {
                entity_repo,
                op_repo,
                config: config.clone(),
            }),
            config,
        }
    }

    /// Start the scheduling loop. Returns the join handle and a shutdown
    /// sender; dropping or firing the sender stops the loop at the next
    /// tick, after which in-flight operations finish their current batch
    /// and are re-adopted on the next start.
    pub fn start(&self) -> (JoinHandle<()>, oneshot::Sender<()>) {
        let processor = self.processor.clone();
        let config = self.config.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let pool = Arc::new(Semaphore::new(config.worker_count.max(1)));

            Self::recover_orphaned(&processor, &pool).await;

            loop {
                match shutdown_rx.try_recv() {
                    Err(oneshot::error::TryRecvError::Empty) => {}
                    _ => break,
                }

                if let Err(e) = Self::tick(&processor, &pool).await {
                    error!("scheduler tick failed: {}", e);
                }

                tokio::time::sleep(Duration::from_millis(config.poll_interval_ms)).await;
            }

            info!("delete scheduler shutting down");
        });

        (handle, shutdown_tx)
    }

    /// Re-adopt operations left `in_progress` by a previous process. They
    /// run through the same routine as freshly claimed ones and pick up
    /// from the soft-delete state already persisted on entities.
    async fn recover_orphaned(processor: &Arc<OperationProcessor>, pool: &Arc<Semaphore>) {
        let orphaned = match processor.op_repo.list_in_progress().await {
            Ok(ops) => ops,
            Err(e) => {
                error!("startup recovery scan failed: {}", e);
                return;
            }
        };
        if orphaned.is_empty() {
            return;
        }

        info!("recovering {} orphaned delete operation(s)", orphaned.len());
        for op in orphaned {
            let processor = processor.clone();
            let pool = pool.clone();
            tokio::spawn(async move {
                let Ok(permit) = pool.acquire_owned().await else {
                    return;
                };
                processor.process(op).await;
                drop(permit);
            });
        }
    }

    async fn tick(processor: &Arc<OperationProcessor>, pool: &Arc<Semaphore>) -> DomainResult<()> {
        let purged = processor.op_repo.purge_expired(Utc::now()).await?;
        if purged > 0 {
            debug!("swept {} expired delete operation(s)", purged);
        }

        let pending = processor.op_repo.list_pending().await?;
        for op in pending {
            // No free worker: stop claiming and let the next tick retry.
            let Ok(permit) = pool.clone().try_acquire_owned() else {
                break;
            };

            match processor
                .op_repo
                .try_claim(op.world_id, op.id, Utc::now())
                .await?
            {
                Some(claimed) => {
                    let processor = processor.clone();
                    tokio::spawn(async move {
                        processor.process(claimed).await;
                        drop(permit);
                    });
                }
                None => {
                    debug!("operation {} claimed by another scheduler", op.id);
                }
            }
        }
        Ok(())
    }
}

/// Drives a single claimed operation to a terminal state.
pub(crate) struct OperationProcessor {
    pub(crate) entity_repo: Arc<dyn EntityRepository>,
    pub(crate) op_repo: Arc<dyn OperationLogRepository>,
    pub(crate) config: DeleteEngineConfig,
}

impl OperationProcessor {
    pub(crate) async fn process(&self, op: DeleteOperation) {
        let op_id = op.id;
        match self.run(op).await {
            Ok(finished) => {
                info!(
                    "operation {} finished as {} ({}/{} deleted, {} failed)",
                    op_id,
                    finished.status.as_str(),
                    finished.deleted_count,
                    finished.total_entities,
                    finished.failed_count
                );
            }
            Err(e) => {
                // Left in_progress; the next scheduler start re-adopts it.
                error!("operation {} interrupted: {}", op_id, e);
            }
        }
    }

    async fn run(&self, mut op: DeleteOperation) -> DomainResult<DeleteOperation> {
        if op.cancel_requested {
            return self.finish(op, OperationStatus::Cancelled, None).await;
        }

        let root = match self
            .entity_repo
            .find_by_id_including_deleted(op.world_id, op.root_entity_id)
            .await
        {
            Ok(root) => root,
            Err(DomainError::EntityNotFound(_, _)) => {
                return self
                    .finish(op, OperationStatus::Failed, Some("root entity not found"))
                    .await;
            }
            Err(e) => return Err(e),
        };

        let mut plan = if op.cascade {
            let descendants = self
                .entity_repo
                .list_descendants(op.world_id, root.id)
                .await?;
            plan_cascade(root.id, &descendants)
        } else {
            let child_count = self
                .entity_repo
                .count_children(op.world_id, root.id)
                .await?;
            if child_count > 0 && !root.is_deleted {
                return self
                    .finish(
                        op,
                        OperationStatus::Failed,
                        Some("entity has non-deleted children"),
                    )
                    .await;
            }
            plan_single(root.id)
        };
        // The plan always ends with the root. An already-deleted root is
        // not part of the work: for an idempotent redelete the plan empties
        // out entirely, and on resume the root must not be counted twice.
        if root.is_deleted {
            plan.pop();
        }

        if op.total_entities == 0 {
            op.total_entities = plan.len() as i64;
            op = self.checkpoint(op).await?;
            if op.cancel_requested {
                return self.finish(op, OperationStatus::Cancelled, None).await;
            }
        }

        // A previously-failed entity is still live, so the fresh plan
        // re-attempts it; a tally carried over from an interrupted run
        // would double-count it or leave a phantom failure behind.
        op.failed_count = 0;
        op.failed_entity_ids.clear();

        for chunk in plan.chunks(self.config.batch_size.max(1)) {
            let mut batch_deleted = 0i64;
            let mut batch_failed: Vec<Uuid> = Vec::new();

            for &entity_id in chunk {
                match self.delete_one(op.world_id, entity_id, op.created_by).await {
                    Ok(DeleteOutcome::Deleted) => batch_deleted += 1,
                    Ok(DeleteOutcome::Failed(reason)) => {
                        warn!(
                            "operation {}: failed to delete entity {}: {}",
                            op.id, entity_id, reason
                        );
                        batch_failed.push(entity_id);
                    }
                    Err(e) => {
                        // Unrecoverable backend error: fold in what this
                        // batch achieved and terminate the operation.
                        op.deleted_count += batch_deleted;
                        op.failed_count += batch_failed.len() as i64;
                        self.record_failed_ids(&mut op, &batch_failed);
                        return self
                            .finish(
                                op,
                                OperationStatus::Failed,
                                Some(&format!("unrecoverable error: {}", e)),
                            )
                            .await;
                    }
                }
            }

            op.deleted_count += batch_deleted;
            op.failed_count += batch_failed.len() as i64;
            self.record_failed_ids(&mut op, &batch_failed);

            op = self.checkpoint(op).await?;
            if op.cancel_requested {
                return self.finish(op, OperationStatus::Cancelled, None).await;
            }
        }

        // Every planned entity was either deleted or tallied as failed, so
        // the split is fully determined by the failure count. This also
        // repairs an undercount from a checkpoint lost to a crash.
        op.deleted_count = op.total_entities - op.failed_count;
        let status = if op.failed_count == 0 {
            OperationStatus::Completed
        } else if op.failed_count >= op.total_entities {
            OperationStatus::Failed
        } else {
            OperationStatus::Partial
        };
        self.finish(op, status, None).await
    }

    /// Soft-delete one entity, absorbing transient errors with backoff and
    /// etag races with a single re-read. Returns `Err` only for errors that
    /// must terminate the whole operation.
    async fn delete_one(
        &self,
        world_id: Uuid,
        entity_id: Uuid,
        deleted_by: Uuid,
    ) -> DomainResult<DeleteOutcome> {
        let mut transient_attempts = 0usize;
        let mut conflict_retried = false;

        loop {
            let entity = match self
                .entity_repo
                .find_by_id_including_deleted(world_id, entity_id)
                .await
            {
                Ok(entity) => entity,
                Err(DomainError::EntityNotFound(_, _)) => {
                    return Ok(DeleteOutcome::Failed("entity not found".to_string()));
                }
                Err(e) if e.is_transient() => {
                    if transient_attempts >= self.config.soft_delete_retries {
                        return Ok(DeleteOutcome::Failed(format!("transient error: {}", e)));
                    }
                    self.backoff(transient_attempts).await;
                    transient_attempts += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if entity.is_deleted {
                return Ok(DeleteOutcome::Deleted);
            }

            match self
                .entity_repo
                .soft_delete(world_id, entity_id, &entity.etag, deleted_by)
                .await
            {
                Ok(_) => return Ok(DeleteOutcome::Deleted),
                Err(DomainError::VersionConflict(_, _)) => {
                    if conflict_retried {
                        return Ok(DeleteOutcome::Failed("etag conflict".to_string()));
                    }
                    conflict_retried = true;
                }
                Err(DomainError::EntityNotFound(_, _)) => {
                    return Ok(DeleteOutcome::Failed("entity not found".to_string()));
                }
                Err(e) if e.is_transient() => {
                    if transient_attempts >= self.config.soft_delete_retries {
                        return Ok(DeleteOutcome::Failed(format!("transient error: {}", e)));
                    }
                    self.backoff(transient_attempts).await;
                    transient_attempts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn backoff(&self, attempt: usize) {
        let ms = self
            .config
            .retry_backoff_ms
            .get(attempt)
            .or(self.config.retry_backoff_ms.last())
            .copied()
            .unwrap_or(1000);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    fn record_failed_ids(&self, op: &mut DeleteOperation, failed: &[Uuid]) {
        for &id in failed {
            if op.failed_entity_ids.len() < self.config.max_failed_entity_ids {
                op.failed_entity_ids.push(id);
            }
        }
    }

    /// Persist progress, refreshing the heartbeat. On a CAS race the record
    /// is re-read and the write replayed; the returned record carries the
    /// stored cancel flag, which the caller checks at the batch boundary.
    async fn checkpoint(&self, mut op: DeleteOperation) -> DomainResult<DeleteOperation> {
        loop {
            let expected = op.last_heartbeat;
            let mut snapshot = op.clone();
            snapshot.last_heartbeat = Utc::now();
            if snapshot.total_entities > 0 {
                snapshot.deleted_count = snapshot
                    .deleted_count
                    .min(snapshot.total_entities - snapshot.failed_count);
            }

            match self.op_repo.update(&snapshot, expected).await {
                Ok(stored) => return Ok(stored),
                Err(DomainError::VersionConflict(_, _)) => {
                    debug!("operation {} checkpoint raced; replaying", op.id);
                    let current = self.op_repo.find_by_id(op.world_id, op.id).await?;
                    op.last_heartbeat = current.last_heartbeat;
                    op.cancel_requested = current.cancel_requested;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn finish(
        &self,
        mut op: DeleteOperation,
        status: OperationStatus,
        error_details: Option<&str>,
    ) -> DomainResult<DeleteOperation> {
        let now = Utc::now();
        op.status = status;
        op.completed_at = Some(now);
        op.ttl_expires_at = Some(now + TtlDuration::hours(self.config.operation_ttl_hours));
        if let Some(details) = error_details {
            op.error_details = Some(details.to_string());
        }
        self.checkpoint(op).await
    }
}
