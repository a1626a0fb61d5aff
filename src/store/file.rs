//! JSON file backed entity store
//!
//! The whole table is one JSON document. Every mutation rewrites it through a
//! temporary file and a rename, so a crash leaves either the old or the new
//! document on disk.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::entity::{EntityRecord, NewEntity};
use super::memory::Table;
use super::EntityStore;
use crate::error::{IntrospectionError, Result};

#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    table: Mutex<Table>,
}

impl JsonFileStore {
    /// Open (or create) the store at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let table = if path.exists() {
            load(&path)?
        } else {
            Table::default()
        };

        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read<T>(&self, f: impl FnOnce(&Table) -> T) -> Result<T> {
        let table = self.lock()?;
        Ok(f(&table))
    }

    /// Apply `f` and persist; the in-memory table is only updated if the write succeeds
    fn write<T>(&self, f: impl FnOnce(&mut Table) -> T) -> Result<T> {
        let mut table = self.lock()?;
        let mut next = table.clone();
        let out = f(&mut next);
        save(&self.path, &next)?;
        *table = next;
        Ok(out)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Table>> {
        self.table
            .lock()
            .map_err(|_| IntrospectionError::Store("file store poisoned".into()))
    }
}

fn load(path: &Path) -> Result<Table> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json)
        .map_err(|e| IntrospectionError::Store(format!("corrupt store {}: {}", path.display(), e)))
}

fn save(path: &Path, table: &Table) -> Result<()> {
    let json = serde_json::to_string_pretty(table)
        .map_err(|e| IntrospectionError::Store(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl EntityStore for JsonFileStore {
    fn get(&self, id: i64) -> Result<Option<EntityRecord>> {
        self.read(|t| t.get(id))
    }

    fn create(&self, values: NewEntity) -> Result<EntityRecord> {
        self.write(|t| t.insert(values))
    }

    fn delete_by_instance(&self, instance_id: &str) -> Result<()> {
        self.write(|t| t.delete_where(|r| r.instance_id == instance_id))
            .map(|_| ())
    }

    fn delete_by_id(&self, id: i64) -> Result<()> {
        self.write(|t| t.delete_where(|r| r.id == id)).map(|_| ())
    }

    fn get_all(&self) -> Result<Vec<EntityRecord>> {
        self.read(|t| t.select(|_| true))
    }

    fn get_by_instance(&self, instance_id: &str, _use_replica: bool) -> Result<Vec<EntityRecord>> {
        self.read(|t| t.select(|r| r.instance_id == instance_id))
    }
}
