//! Type definitions for the entity tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::{DomainError, DomainResult, ValidationError};

/// A single node in a world's hierarchical content tree.
///
/// `path` holds the ancestor ids from the root down, exclusive of the node
/// itself, so `depth == path.len()` and a root node has an empty path. The
/// core never hard-deletes entities; `is_deleted` is the only mutation it
/// performs, and every persisted mutation rotates `etag`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: Uuid,
    pub world_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub name: String,
    pub path: Vec<Uuid>,
    pub depth: i64,
    pub owner_id: Uuid,
    pub is_deleted: bool,
    pub deleted_by: Option<Uuid>,
    pub etag: String,
    pub modified_at: DateTime<Utc>,
}

impl Entity {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Opaque version token; regenerated on every persisted mutation.
    pub fn new_etag() -> String {
        Uuid::new_v4().to_string()
    }
}

/// NewEntity DTO - used when creating a new node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEntity {
    pub world_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub name: String,
    pub owner_id: Uuid,
}

impl NewEntity {
    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::required("name").into());
        }
        if self.name.len() > 200 {
            return Err(ValidationError::max_length("name", 200).into());
        }
        Ok(())
    }
}

/// EntityRow - SQLite row representation for mapping from database
#[derive(Debug, Clone, FromRow)]
pub struct EntityRow {
    pub id: String,
    pub world_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub path: String,
    pub depth: i64,
    pub owner_id: String,
    pub is_deleted: i64,
    pub deleted_by: Option<String>,
    pub etag: String,
    pub modified_at: String,
}

impl EntityRow {
    pub fn into_entity(self) -> DomainResult<Entity> {
        let path: Vec<Uuid> = serde_json::from_str(&self.path)
            .map_err(|e| DomainError::Internal(format!("invalid entity path: {}", e)))?;

        Ok(Entity {
            id: parse_uuid("id", &self.id)?,
            world_id: parse_uuid("world_id", &self.world_id)?,
            parent_id: self
                .parent_id
                .as_deref()
                .map(|s| parse_uuid("parent_id", s))
                .transpose()?,
            name: self.name,
            path,
            depth: self.depth,
            owner_id: parse_uuid("owner_id", &self.owner_id)?,
            is_deleted: self.is_deleted != 0,
            deleted_by: self
                .deleted_by
                .as_deref()
                .map(|s| parse_uuid("deleted_by", s))
                .transpose()?,
            etag: self.etag,
            modified_at: parse_datetime("modified_at", &self.modified_at)?,
        })
    }
}

pub(crate) fn parse_uuid(field: &str, value: &str) -> DomainResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| DomainError::Internal(format!("invalid {} '{}': {}", field, value, e)))
}

pub(crate) fn parse_datetime(field: &str, value: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DomainError::Internal(format!("invalid {} '{}': {}", field, value, e)))
}
