pub mod memory;
pub mod repository;
pub mod types;

pub use memory::InMemoryEntityRepository;
pub use repository::{EntityRepository, SqliteEntityRepository};
pub use types::{Entity, NewEntity};
