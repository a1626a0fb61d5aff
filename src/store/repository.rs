//! Entity repository
//!
//! Thin layer over an `EntityStore`: maps rows to `IntrospectedEntity`,
//! turns a missing row into `NotFound`, and keeps `create` create-only.

use std::sync::Arc;

use super::entity::IntrospectedEntity;
use super::EntityStore;
use crate::error::{IntrospectionError, Result};

#[derive(Clone)]
pub struct EntityRepository {
    store: Arc<dyn EntityStore>,
}

impl EntityRepository {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    pub fn get_by_id(&self, id: i64) -> Result<IntrospectedEntity> {
        self.store
            .get(id)?
            .map(IntrospectedEntity::from)
            .ok_or_else(|| IntrospectionError::NotFound(format!("introspected entity {}", id)))
    }

    /// Persist a draft and return it with its assigned identity
    ///
    /// # Errors
    /// * `ActionError` - the draft already has an id (create never upserts)
    pub fn create(&self, draft: IntrospectedEntity) -> Result<IntrospectedEntity> {
        if draft.is_created() {
            return Err(IntrospectionError::ActionError {
                action: "create".to_string(),
                reason: "already created".to_string(),
            });
        }
        let record = self.store.create(draft.to_new())?;
        tracing::debug!(entity_id = record.id, instance_id = %record.instance_id, "entity created");
        Ok(record.into())
    }

    pub fn delete_by_instance(&self, instance_id: &str) -> Result<()> {
        self.store.delete_by_instance(instance_id)
    }

    pub fn delete_by_id(&self, id: i64) -> Result<()> {
        self.store.delete_by_id(id)
    }

    pub fn list_all(&self) -> Result<Vec<IntrospectedEntity>> {
        Ok(self.store.get_all()?.into_iter().map(Into::into).collect())
    }

    pub fn list_by_instance(
        &self,
        instance_id: &str,
        prefer_replica: bool,
    ) -> Result<Vec<IntrospectedEntity>> {
        Ok(self
            .store
            .get_by_instance(instance_id, prefer_replica)?
            .into_iter()
            .map(Into::into)
            .collect())
    }
}

impl std::fmt::Debug for EntityRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRepository").finish_non_exhaustive()
    }
}
