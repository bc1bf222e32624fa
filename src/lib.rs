//! Asynchronous cascade delete engine for a worldbuilding platform's
//! hierarchical entity trees. Accepts delete intents, discovers descendants,
//! soft-deletes them child-first in checkpointed batches, exposes progress
//! through a durable operation log, survives process restarts, and bounds
//! concurrent operations per principal per world.

// Public modules
pub mod api;
pub mod auth;
pub mod database;
pub mod domains;
pub mod errors;

use std::sync::Arc;

use crate::domains::deletion::{
    DeleteEngineConfig, DeleteOperationService, DeleteOperationServiceImpl, DeleteScheduler,
    SqliteOperationLogRepository,
};
use crate::domains::entity::{EntityRepository, SqliteEntityRepository};
use crate::errors::{DomainError, ServiceResult};

/// The assembled engine: the store handles the host wires into its entity
/// management, the service it exposes over HTTP, and the scheduler it
/// starts alongside its server loop.
pub struct DeleteEngine {
    pub entities: Arc<dyn EntityRepository>,
    pub service: Arc<dyn DeleteOperationService>,
    pub scheduler: DeleteScheduler,
}

/// Open the database, apply migrations, and wire up the engine over the
/// durable repositories. The caller starts background processing with
/// `engine.scheduler.start()`.
pub async fn initialize(db_url: &str, config: DeleteEngineConfig) -> ServiceResult<DeleteEngine> {
    let pool = database::init_pool(db_url)
        .await
        .map_err(DomainError::Database)?;

    let entities: Arc<dyn EntityRepository> = Arc::new(SqliteEntityRepository::new(pool.clone()));
    let operations = Arc::new(SqliteOperationLogRepository::new(pool));

    let service = Arc::new(DeleteOperationServiceImpl::new(
        entities.clone(),
        operations.clone(),
        config.clone(),
    ));
    let scheduler = DeleteScheduler::new(entities.clone(), operations, config);

    Ok(DeleteEngine {
        entities,
        service,
        scheduler,
    })
}
