pub mod memory;
pub mod planner;
pub mod repository;
pub mod service;
pub mod types;
pub mod worker;

pub use memory::InMemoryOperationLogRepository;
pub use repository::{OperationLogRepository, SqliteOperationLogRepository};
pub use service::{DeleteOperationService, DeleteOperationServiceImpl};
pub use types::{DeleteEngineConfig, DeleteOperation, OperationStatus, RetryAuditEntry};
pub use worker::DeleteScheduler;
