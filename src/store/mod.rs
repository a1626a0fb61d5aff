//! Introspected entity persistence
//!
//! - `entity` - the persisted record
//! - `EntityStore` - the storage collaborator (memory or JSON file)
//! - `EntityRepository` - identity checks and field mapping over a store

pub mod entity;
pub mod file;
pub mod memory;
pub mod repository;

pub use entity::{EntityRecord, IntrospectedEntity, NewEntity};
pub use file::JsonFileStore;
pub use memory::MemoryStore;
pub use repository::EntityRepository;

use crate::error::Result;

/// Storage collaborator for entity records
///
/// Each call is atomic on its own; there are no cross-call transactions.
/// Soft-deleted rows are invisible to every read.
pub trait EntityStore: Send + Sync {
    fn get(&self, id: i64) -> Result<Option<EntityRecord>>;

    /// Insert a row and assign its id and timestamps
    fn create(&self, values: NewEntity) -> Result<EntityRecord>;

    fn delete_by_instance(&self, instance_id: &str) -> Result<()>;

    fn delete_by_id(&self, id: i64) -> Result<()>;

    fn get_all(&self) -> Result<Vec<EntityRecord>>;

    /// `use_replica` lets a store serve the read from a replica
    fn get_by_instance(&self, instance_id: &str, use_replica: bool) -> Result<Vec<EntityRecord>>;
}
