//! In-memory entity store

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::entity::{EntityRecord, NewEntity};
use super::EntityStore;
use crate::error::{IntrospectionError, Result};

/// Rows plus the id sequence, shared by the memory and file stores
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Table {
    next_id: i64,
    rows: BTreeMap<i64, EntityRecord>,
}

impl Default for Table {
    fn default() -> Self {
        Self {
            next_id: 1,
            rows: BTreeMap::new(),
        }
    }
}

impl Table {
    pub(crate) fn get(&self, id: i64) -> Option<EntityRecord> {
        self.rows.get(&id).filter(|r| !r.deleted).cloned()
    }

    pub(crate) fn insert(&mut self, values: NewEntity) -> EntityRecord {
        let id = self.next_id;
        self.next_id += 1;
        let record = EntityRecord::insert(id, values);
        self.rows.insert(id, record.clone());
        record
    }

    /// Returns how many live rows were deleted
    pub(crate) fn delete_where(&mut self, pred: impl Fn(&EntityRecord) -> bool) -> usize {
        let mut count = 0;
        for record in self.rows.values_mut().filter(|r| !r.deleted && pred(r)) {
            record.soft_delete();
            count += 1;
        }
        count
    }

    pub(crate) fn select(&self, pred: impl Fn(&EntityRecord) -> bool) -> Vec<EntityRecord> {
        self.rows
            .values()
            .filter(|r| !r.deleted && pred(r))
            .cloned()
            .collect()
    }
}

/// Store that lives and dies with the process
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: Mutex<Table>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_table<T>(&self, f: impl FnOnce(&mut Table) -> T) -> Result<T> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| IntrospectionError::Store("memory store poisoned".into()))?;
        Ok(f(&mut table))
    }
}

impl EntityStore for MemoryStore {
    fn get(&self, id: i64) -> Result<Option<EntityRecord>> {
        self.with_table(|t| t.get(id))
    }

    fn create(&self, values: NewEntity) -> Result<EntityRecord> {
        self.with_table(|t| t.insert(values))
    }

    fn delete_by_instance(&self, instance_id: &str) -> Result<()> {
        self.with_table(|t| t.delete_where(|r| r.instance_id == instance_id))
            .map(|_| ())
    }

    fn delete_by_id(&self, id: i64) -> Result<()> {
        self.with_table(|t| t.delete_where(|r| r.id == id)).map(|_| ())
    }

    fn get_all(&self) -> Result<Vec<EntityRecord>> {
        self.with_table(|t| t.select(|_| true))
    }

    fn get_by_instance(&self, instance_id: &str, _use_replica: bool) -> Result<Vec<EntityRecord>> {
        self.with_table(|t| t.select(|r| r.instance_id == instance_id))
    }
}
