use async_trait::async_trait;
use chrono::Utc;
use sqlx::{query, query_as, query_scalar, SqlitePool};
use uuid::Uuid;

use crate::domains::entity::types::{Entity, EntityRow, NewEntity};
use crate::errors::{DbError, DomainError, DomainResult};

/// Partitioned access to entity documents with optimistic concurrency.
///
/// Every operation is scoped by `world_id`, the partition key; cross-world
/// reads are not expressible through this interface.
#[async_trait]
pub trait EntityRepository: Send + Sync {
    /// Insert a new node under its parent. The seeding surface for the
    /// entity-management collaborator and for tests.
    async fn create(&self, new_entity: &NewEntity) -> DomainResult<Entity>;

    /// Find a non-deleted entity by ID.
    async fn find_by_id(&self, world_id: Uuid, id: Uuid) -> DomainResult<Entity>;

    /// Find an entity by ID regardless of its soft-delete state. The engine
    /// needs this variant so redeleting an already-deleted root stays
    /// idempotent instead of turning into a not-found failure.
    async fn find_by_id_including_deleted(&self, world_id: Uuid, id: Uuid)
        -> DomainResult<Entity>;

    /// Number of non-deleted direct children.
    async fn count_children(&self, world_id: Uuid, parent_id: Uuid) -> DomainResult<i64>;

    /// Every non-deleted descendant of `root_id`, ordered by depth ascending
    /// with ties broken by id. Finite and restartable; re-invocation reflects
    /// the current tree state.
    async fn list_descendants(&self, world_id: Uuid, root_id: Uuid) -> DomainResult<Vec<Entity>>;

    /// Flip the soft-delete flag, guarded by the caller's etag. Returns the
    /// new etag. Already-deleted entities are a no-op returning the stored
    /// etag; a live entity with a stale etag is a `VersionConflict`.
    async fn soft_delete(
        &self,
        world_id: Uuid,
        id: Uuid,
        expected_etag: &str,
        deleted_by: Uuid,
    ) -> DomainResult<String>;
}

/// SQLite implementation for EntityRepository
#[derive(Debug, Clone)]
pub struct SqliteEntityRepository {
    pool: SqlitePool,
}

impl SqliteEntityRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch(
        &self,
        world_id: Uuid,
        id: Uuid,
        include_deleted: bool,
    ) -> DomainResult<Entity> {
        let sql = if include_deleted {
            "SELECT * FROM entities WHERE world_id = ? AND id = ?"
        } else {
            "SELECT * FROM entities WHERE world_id = ? AND id = ? AND is_deleted = 0"
        };
        let row = query_as::<_, EntityRow>(sql)
            .bind(world_id.to_string())
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::EntityNotFound("Entity".to_string(), id))?;

        row.into_entity()
    }
}

#[async_trait]
impl EntityRepository for SqliteEntityRepository {
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

        let path_json = serde_json::to_string(&entity.path)
            .map_err(|e| DomainError::Internal(format!("failed to encode path: {}", e)))?;

        query(
            "INSERT INTO entities (
                id, world_id, parent_id, name, path, depth, owner_id,
                is_deleted, deleted_by, etag, modified_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, NULL, ?, ?)",
        )
        .bind(entity.id.to_string())
        .bind(entity.world_id.to_string())
        .bind(entity.parent_id.map(|id| id.to_string()))
        .bind(&entity.name)
        .bind(path_json)
        .bind(entity.depth)
        .bind(entity.owner_id.to_string())
        .bind(&entity.etag)
        .bind(entity.modified_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(entity)
    }

    async fn find_by_id(&self, world_id: Uuid, id: Uuid) -> DomainResult<Entity> {
        self.fetch(world_id, id, false).await
    }

    async fn find_by_id_including_deleted(
        &self,
        world_id: Uuid,
        id: Uuid,
    ) -> DomainResult<Entity> {
        self.fetch(world_id, id, true).await
    }

    async fn count_children(&self, world_id: Uuid, parent_id: Uuid) -> DomainResult<i64> {
        let count: i64 = query_scalar(
            "SELECT COUNT(*) FROM entities
             WHERE world_id = ? AND parent_id = ? AND is_deleted = 0",
        )
        .bind(world_id.to_string())
        .bind(parent_id.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(count)
    }

    async fn list_descendants(&self, world_id: Uuid, root_id: Uuid) -> DomainResult<Vec<Entity>> {
        // instr on the JSON path is a coarse prefilter; the exact membership
        // check happens after decoding, since uuids cannot collide as
        // substrings of one another.
        let rows = query_as::<_, EntityRow>(
            "SELECT * FROM entities
             WHERE world_id = ? AND is_deleted = 0 AND instr(path, ?) > 0
             ORDER BY depth ASC, id ASC",
        )
        .bind(world_id.to_string())
        .bind(root_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        let mut descendants = Vec::with_capacity(rows.len());
        for row in rows {
            let entity = row.into_entity()?;
            if entity.path.contains(&root_id) {
                descendants.push(entity);
            }
        }
        Ok(descendants)
    }

    async fn soft_delete(
        &self,
        world_id: Uuid,
        id: Uuid,
        expected_etag: &str,
        deleted_by: Uuid,
    ) -> DomainResult<String> {
        let new_etag = Entity::new_etag();
        let result = query(
            "UPDATE entities
             SET is_deleted = 1, deleted_by = ?, etag = ?, modified_at = ?
             WHERE world_id = ? AND id = ? AND etag = ? AND is_deleted = 0",
        )
        .bind(deleted_by.to_string())
        .bind(&new_etag)
        .bind(Utc::now().to_rfc3339())
        .bind(world_id.to_string())
        .bind(id.to_string())
        .bind(expected_etag)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() > 0 {
            return Ok(new_etag);
        }

        // Zero rows updated: missing, already deleted, or a stale etag.
        let current = self.fetch(world_id, id, true).await?;
        if current.is_deleted {
            Ok(current.etag)
        } else {
            Err(DomainError::VersionConflict("Entity".to_string(), id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_pool;

    async fn repo() -> SqliteEntityRepository {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        SqliteEntityRepository::new(pool)
    }

    fn new_root(world_id: Uuid, owner_id: Uuid, name: &str) -> NewEntity {
        NewEntity {
            world_id,
            parent_id: None,
            name: name.to_string(),
            owner_id,
        }
    }

    #[tokio::test]
    async fn test_create_builds_path_and_depth() {
        let repo = repo().await;
        let world = Uuid::new_v4();
        let owner = Uuid::new_v4();

        let root = repo.create(&new_root(world, owner, "Aldervale")).await.unwrap();
        assert!(root.is_root());
        assert_eq!(root.depth, 0);

        let child = repo
            .create(&NewEntity {
                world_id: world,
                parent_id: Some(root.id),
                name: "The Sunken Keep".to_string(),
                owner_id: owner,
            })
            .await
            .unwrap();
        assert_eq!(child.depth, 1);
        assert_eq!(child.path, vec![root.id]);

        let grandchild = repo
            .create(&NewEntity {
                world_id: world,
                parent_id: Some(child.id),
                name: "Oubliette".to_string(),
                owner_id: owner,
            })
            .await
            .unwrap();
        assert_eq!(grandchild.path, vec![root.id, child.id]);
    }

    #[tokio::test]
    async fn test_soft_delete_rotates_etag_and_is_idempotent() {
        let repo = repo().await;
        let world = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let root = repo.create(&new_root(world, owner, "Aldervale")).await.unwrap();

        let new_etag = repo
            .soft_delete(world, root.id, &root.etag, owner)
            .await
            .unwrap();
        assert_ne!(new_etag, root.etag);

        // find_by_id no longer sees it; the including-deleted variant does.
        assert!(matches!(
            repo.find_by_id(world, root.id).await,
            Err(DomainError::EntityNotFound(_, _))
        ));
        let deleted = repo
            .find_by_id_including_deleted(world, root.id)
            .await
            .unwrap();
        assert!(deleted.is_deleted);
        assert_eq!(deleted.deleted_by, Some(owner));

        // Redeleting is a no-op returning the stored etag.
        let again = repo
            .soft_delete(world, root.id, &root.etag, owner)
            .await
            .unwrap();
        assert_eq!(again, new_etag);
    }

    #[tokio::test]
    async fn test_soft_delete_stale_etag_conflicts() {
        let repo = repo().await;
        let world = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let root = repo.create(&new_root(world, owner, "Aldervale")).await.unwrap();

        let result = repo.soft_delete(world, root.id, "stale", owner).await;
        assert!(matches!(result, Err(DomainError::VersionConflict(_, _))));
    }

    #[tokio::test]
    async fn test_descendants_ordered_and_scoped() {
        let repo = repo().await;
        let world = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let root = repo.create(&new_root(world, owner, "Aldervale")).await.unwrap();
        let child = repo
            .create(&NewEntity {
                world_id: world,
                parent_id: Some(root.id),
                name: "Keep".to_string(),
                owner_id: owner,
            })
            .await
            .unwrap();
        let grandchild = repo
            .create(&NewEntity {
                world_id: world,
                parent_id: Some(child.id),
                name: "Cellar".to_string(),
                owner_id: owner,
            })
            .await
            .unwrap();

        // An unrelated world must stay invisible.
        let other_world = Uuid::new_v4();
        repo.create(&new_root(other_world, owner, "Elsewhere"))
            .await
            .unwrap();

        let descendants = repo.list_descendants(world, root.id).await.unwrap();
        let ids: Vec<Uuid> = descendants.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![child.id, grandchild.id]);

        repo.soft_delete(world, grandchild.id, &grandchild.etag, owner)
            .await
            .unwrap();
        let remaining = repo.list_descendants(world, root.id).await.unwrap();
        assert_eq!(remaining.len(), 1);

        assert_eq!(repo.count_children(world, root.id).await.unwrap(), 1);
        assert_eq!(repo.count_children(world, child.id).await.unwrap(), 0);
    }
}
