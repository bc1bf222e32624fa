use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::deletion::repository::OperationLogRepository;
use crate::domains::deletion::types::{DeleteEngineConfig, DeleteOperation};
use crate::domains::entity::repository::EntityRepository;
use crate::errors::{ServiceError, ServiceResult};

/// Admission, query, and control plane for cascade delete operations.
///
/// `initiate` only records intent: it validates preconditions, persists a
/// `pending` record, and returns the handle. Enumeration and deletion are
/// entirely the scheduler's business, so this call stays two I/O round
/// trips regardless of subtree size.
#[async_trait]
pub trait DeleteOperationService: Send + Sync {
    /// Admit a delete request for `entity_id` and everything beneath it.
    ///
    /// Fails with `RateLimitExceeded` when the principal already has the
    /// configured number of active operations in this world, with
    /// `EntityNotFound` when the target never existed, and with
    /// `EntityHasChildren` when `cascade` is false but live children exist.
    /// An already-deleted target is admitted; its operation completes with
    /// nothing to do.
    async fn initiate(
        &self,
        world_id: Uuid,
        entity_id: Uuid,
        cascade: bool,
        auth: &AuthContext,
    ) -> ServiceResult<DeleteOperation>;

    async fn get_status(&self, world_id: Uuid, op_id: Uuid) -> ServiceResult<DeleteOperation>;

    /// Most recent operations in a world; `limit` is clamped to `[1, 100]`.
    async fn list_recent(
        &self,
        world_id: Uuid,
        limit: i64,
    ) -> ServiceResult<Vec<DeleteOperation>>;

    /// Reset a `failed` or `partial` operation to `pending`. The subtree is
    /// re-enumerated on the next claim; the prior attempt is preserved in
    /// the operation's retry history.
    async fn retry(
        &self,
        world_id: Uuid,
        op_id: Uuid,
        auth: &AuthContext,
    ) -> ServiceResult<DeleteOperation>;

    /// Request cooperative cancellation. The scheduler observes the flag at
    /// its next batch boundary and transitions the operation to `cancelled`.
    async fn cancel(
        &self,
        world_id: Uuid,
        op_id: Uuid,
        auth: &AuthContext,
    ) -> ServiceResult<DeleteOperation>;
}

/// Base implementation over the entity store and operation log.
pub struct DeleteOperationServiceImpl {
    entity_repo: Arc<dyn EntityRepository>,
    op_repo: Arc<dyn OperationLogRepository>,
    config: DeleteEngineConfig,
}

impl DeleteOperationServiceImpl {
    pub fn new(
        entity_repo: Arc<dyn EntityRepository>,
        op_repo: Arc<dyn OperationLogRepository>,
        config: DeleteEngineConfig,
    ) -> Self {
        Self {
            entity_repo,
            op_repo,
            config,
        }
    }
}

#[async_trait]
impl DeleteOperationService for DeleteOperationServiceImpl {
    async fn initiate(
        &self,
        world_id: Uuid,
        entity_id: Uuid,
        cascade: bool,
        auth: &AuthContext,
    ) -> ServiceResult<DeleteOperation> {
        let active = self
            .op_repo
            .count_active_by_principal(world_id, auth.user_id)
            .await?;
        if active >= self.config.max_concurrent_per_principal_per_world {
            return Err(ServiceError::RateLimitExceeded {
                retry_after_seconds: self.config.retry_after_seconds,
            });
        }

        let root = self
            .entity_repo
            .find_by_id_including_deleted(world_id, entity_id)
            .await?;

        if !cascade && !root.is_deleted {
            let child_count = self.entity_repo.count_children(world_id, entity_id).await?;
            if child_count > 0 {
                return Err(ServiceError::EntityHasChildren {
                    entity_id,
                    child_count,
                });
            }
        }

        let op = DeleteOperation::new(world_id, entity_id, root.name, cascade, auth.user_id);
        let created = self.op_repo.create(&op).await?;
        info!(
            "admitted delete operation {} for entity {} in world {} (cascade: {})",
            created.id, entity_id, world_id, cascade
        );
        Ok(created)
    }

    async fn get_status(&self, world_id: Uuid, op_id: Uuid) -> ServiceResult<DeleteOperation> {
        Ok(self.op_repo.find_by_id(world_id, op_id).await?)
    }

    async fn list_recent(
        &self,
        world_id: Uuid,
        limit: i64,
    ) -> ServiceResult<Vec<DeleteOperation>> {
        let limit = limit.clamp(1, 100);
        Ok(self.op_repo.list_recent_by_world(world_id, limit).await?)
    }

    async fn retry(
        &self,
        world_id: Uuid,
        op_id: Uuid,
        auth: &AuthContext,
    ) -> ServiceResult<DeleteOperation> {
        let reset = self
            .op_repo
            .reset_for_retry(world_id, op_id, auth.user_id)
            .await?;
        info!("operation {} reset to pending for retry", op_id);
        Ok(reset)
    }

    async fn cancel(
        &self,
        world_id: Uuid,
        op_id: Uuid,
        _auth: &AuthContext,
    ) -> ServiceResult<DeleteOperation> {
        let op = self.op_repo.request_cancel(world_id, op_id).await?;
        info!("cancellation requested for operation {}", op_id);
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::deletion::memory::InMemoryOperationLogRepository;
    use crate::domains::deletion::types::OperationStatus;
    use crate::domains::entity::memory::InMemoryEntityRepository;
    use crate::domains::entity::types::NewEntity;
    use crate::errors::DomainError;

    struct Fixture {
        entity_repo: Arc<InMemoryEntityRepository>,
        service: DeleteOperationServiceImpl,
        world: Uuid,
        auth: AuthContext,
    }

    fn fixture_with_config(config: DeleteEngineConfig) -> Fixture {
        let entity_repo = Arc::new(InMemoryEntityRepository::new());
        let op_repo = Arc::new(InMemoryOperationLogRepository::new());
        let service =
            DeleteOperationServiceImpl::new(entity_repo.clone(), op_repo, config);
        Fixture {
            entity_repo,
            service,
            world: Uuid::new_v4(),
            auth: AuthContext::new(Uuid::new_v4()),
        }
    }

    fn fixture() -> Fixture {
        fixture_with_config(DeleteEngineConfig::default())
    }

    async fn seed(
        fixture: &Fixture,
        parent_id: Option<Uuid>,
        name: &str,
    ) -> crate::domains::entity::types::Entity {
        fixture
            .entity_repo
            .create(&NewEntity {
                world_id: fixture.world,
                parent_id,
                name: name.to_string(),
                owner_id: fixture.auth.user_id,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_initiate_creates_pending_operation() {
        let f = fixture();
        let root = seed(&f, None, "Aldervale").await;

        let op = f
            .service
            .initiate(f.world, root.id, true, &f.auth)
            .await
            .unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.total_entities, 0);
        assert_eq!(op.root_entity_name, "Aldervale");
        assert_eq!(op.created_by, f.auth.user_id);

        let fetched = f.service.get_status(f.world, op.id).await.unwrap();
        assert_eq!(fetched.id, op.id);
    }

    #[tokio::test]
    async fn test_initiate_missing_entity_is_not_found() {
        let f = fixture();
        let result = f
            .service
            .initiate(f.world, Uuid::new_v4(), true, &f.auth)
            .await;
        assert!(matches!(
            result,
            Err(ServiceError::Domain(DomainError::EntityNotFound(_, _)))
        ));
    }

    #[tokio::test]
    async fn test_initiate_without_cascade_rejects_children() {
        let f = fixture();
        let root = seed(&f, None, "Aldervale").await;
        seed(&f, Some(root.id), "Keep").await;

        let result = f.service.initiate(f.world, root.id, false, &f.auth).await;
        assert!(matches!(
            result,
            Err(ServiceError::EntityHasChildren { child_count: 1, .. })
        ));
        // Nothing was persisted and the target is untouched.
        assert!(f
            .service
            .list_recent(f.world, 10)
            .await
            .unwrap()
            .is_empty());
        assert!(!f
            .entity_repo
            .find_by_id(f.world, root.id)
            .await
            .unwrap()
            .is_deleted);
    }

    #[tokio::test]
    async fn test_initiate_admits_already_deleted_entity() {
        let f = fixture();
        let root = seed(&f, None, "Aldervale").await;
        f.entity_repo
            .soft_delete(f.world, root.id, &root.etag, f.auth.user_id)
            .await
            .unwrap();

        let op = f
            .service
            .initiate(f.world, root.id, true, &f.auth)
            .await
            .unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
    }

    #[tokio::test]
    async fn test_rate_limit_caps_active_operations_per_world() {
        let config = DeleteEngineConfig {
            max_concurrent_per_principal_per_world: 2,
            ..Default::default()
        };
        let f = fixture_with_config(config);
        let first = seed(&f, None, "one").await;
        let second = seed(&f, None, "two").await;
        let third = seed(&f, None, "three").await;

        f.service
            .initiate(f.world, first.id, true, &f.auth)
            .await
            .unwrap();
        f.service
            .initiate(f.world, second.id, true, &f.auth)
            .await
            .unwrap();

        let result = f.service.initiate(f.world, third.id, true, &f.auth).await;
        assert!(matches!(
            result,
            Err(ServiceError::RateLimitExceeded {
                retry_after_seconds: 30
            })
        ));

        // A different world has its own allowance.
        let other_world = Uuid::new_v4();
        let elsewhere = f
            .entity_repo
            .create(&NewEntity {
                world_id: other_world,
                parent_id: None,
                name: "elsewhere".to_string(),
                owner_id: f.auth.user_id,
            })
            .await
            .unwrap();
        f.service
            .initiate(other_world, elsewhere.id, true, &f.auth)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_recent_clamps_limit() {
        let f = fixture();
        for i in 0..3 {
            let root = seed(&f, None, &format!("world-{}", i)).await;
            f.service
                .initiate(f.world, root.id, true, &f.auth)
                .await
                .unwrap();
        }

        // A nonsense limit still returns at least one record.
        let listed = f.service.list_recent(f.world, 0).await.unwrap();
        assert_eq!(listed.len(), 1);
        let listed = f.service.list_recent(f.world, -5).await.unwrap();
        assert_eq!(listed.len(), 1);
        let listed = f.service.list_recent(f.world, 1000).await.unwrap();
        assert_eq!(listed.len(), 3);
    }

    #[tokio::test]
    async fn test_retry_requires_retryable_state() {
        let f = fixture();
        let root = seed(&f, None, "Aldervale").await;
        let op = f
            .service
            .initiate(f.world, root.id, true, &f.auth)
            .await
            .unwrap();

        let result = f.service.retry(f.world, op.id, &f.auth).await;
        assert!(matches!(
            result,
            Err(ServiceError::Domain(
                DomainError::InvalidStatusTransition { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn test_cancel_sets_flag_on_pending_operation() {
        let f = fixture();
        let root = seed(&f, None, "Aldervale").await;
        let op = f
            .service
            .initiate(f.world, root.id, true, &f.auth)
            .await
            .unwrap();

        let cancelled = f.service.cancel(f.world, op.id, &f.auth).await.unwrap();
        assert!(cancelled.cancel_requested);
        // The status transition itself is the scheduler's job.
        assert_eq!(cancelled.status, OperationStatus::Pending);
    }
}
