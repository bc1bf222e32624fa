//! In-memory entity store for tests and embedder harnesses.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domains::entity::repository::EntityRepository;
use crate::domains::entity::types::{Entity, NewEntity};
use crate::errors::{DbError, DomainError, DomainResult};

/// HashMap-backed implementation of [`EntityRepository`].
///
/// Besides the trait surface it offers fault injection: a counter of
/// transient failures to serve before succeeding, and a poison set of ids
/// whose soft delete always fails as if the backend were throttling. Both
/// let tests drive the worker's retry and partial-failure paths.
#[derive(Debug, Default)]
pub struct InMemoryEntityRepository {
    entities: RwLock<HashMap<(Uuid, Uuid), Entity>>,
    deletion_log: RwLock<Vec<Uuid>>,
    transient_failures: AtomicU32,
    poisoned: RwLock<HashSet<Uuid>>,
}

impl InMemoryEntityRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// The ids of successfully soft-deleted entities, in deletion order.
    pub async fn deletion_order(&self) -> Vec<Uuid> {
        self.deletion_log.read().await.clone()
    }

    /// Fail the next `n` soft deletes with a transient backend error.
    pub fn inject_transient_failures(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Make every soft delete of `id` fail with a transient backend error.
    pub async fn poison(&self, id: Uuid) {
        self.poisoned.write().await.insert(id);
    }

    /// Let soft deletes of `id` succeed again.
    pub async fn unpoison(&self, id: Uuid) {
        self.poisoned.write().await.remove(&id);
    }

    fn take_transient_failure(&self) -> bool {
        self.transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EntityRepository for InMemoryEntityRepository {
    async fn create(&self, new_entity: &NewEntity) -> DomainResult<Entity> {
        new_entity.validate()?;

        let (path, depth) = match new_entity.parent_id {
            Some(parent_id) => {
                let parent = self.find_by_id(new_entity.world_id, parent_id).await?;
                let mut path = parent.path.clone();
                path.push(parent.id);
                let depth = path.len() as i64;
                (path, depth)
            }
            None => (Vec::new(), 0),
        };

        let entity = Entity {
            id: Uuid::new_v4(),
            world_id: new_entity.world_id,
            parent_id: new_entity.parent_id,
            name: new_entity.name.clone(),
            path,
            depth,
            owner_id: new_entity.owner_id,
            is_deleted: false,
            deleted_by: None,
            etag: Entity::new_etag(),
            modified_at: Utc::now(),
        };

        self.entities
            .write()
            .await
            .insert((entity.world_id, entity.id), entity.clone());
        Ok(entity)
    }

    async fn find_by_id(&self, world_id: Uuid, id: Uuid) -> DomainResult<Entity> {
        self.entities
            .read()
            .await
            .get(&(world_id, id))
            .filter(|e| !e.is_deleted)
            .cloned()
            .ok_or_else(|| DomainError::EntityNotFound("Entity".to_string(), id))
    }

    async fn find_by_id_including_deleted(
        &self,
        world_id: Uuid,
        id: Uuid,
    ) -> DomainResult<Entity> {
        self.entities
            .read()
            .await
            .get(&(world_id, id))
            .cloned()
            .ok_or_else(|| DomainError::EntityNotFound("Entity".to_string(), id))
    }

    async fn count_children(&self, world_id: Uuid, parent_id: Uuid) -> DomainResult<i64> {
        let count = self
            .entities
            .read()
            .await
            .values()
            .filter(|e| {
                e.world_id == world_id && e.parent_id == Some(parent_id) && !e.is_deleted
            })
            .count();
        Ok(count as i64)
    }

    async fn list_descendants(&self, world_id: Uuid, root_id: Uuid) -> DomainResult<Vec<Entity>> {
        let mut descendants: Vec<Entity> = self
            .entities
            .read()
            .await
            .values()
            .filter(|e| e.world_id == world_id && !e.is_deleted && e.path.contains(&root_id))
            .cloned()
            .collect();
        descendants.sort_by(|a, b| a.depth.cmp(&b.depth).then(a.id.cmp(&b.id)));
        Ok(descendants)
    }

    async fn soft_delete(
        &self,
        world_id: Uuid,
        id: Uuid,
        expected_etag: &str,
        deleted_by: Uuid,
    ) -> DomainResult<String> {
        if self.poisoned.read().await.contains(&id) || self.take_transient_failure() {
            return Err(DbError::Locked.into());
        }

        let mut entities = self.entities.write().await;
        let entity = entities
            .get_mut(&(world_id, id))
            .ok_or_else(|| DomainError::EntityNotFound("Entity".to_string(), id))?;

        if entity.is_deleted {
            return Ok(entity.etag.clone());
        }
        if entity.etag != expected_etag {
            return Err(DomainError::VersionConflict("Entity".to_string(), id));
        }

        entity.is_deleted = true;
        entity.deleted_by = Some(deleted_by);
        entity.etag = Entity::new_etag();
        entity.modified_at = Utc::now();
        let new_etag = entity.etag.clone();
        drop(entities);

        self.deletion_log.write().await.push(id);
        Ok(new_etag)
    }
}
