//! Introspected entity records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row as the store keeps it, bookkeeping included
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: i64,
    pub instance_id: String,
    pub drive_id: String,
    pub introspection_target: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted: bool,
}

/// Values supplied on insert
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntity {
    pub instance_id: String,
    pub drive_id: String,
    pub introspection_target: String,
}

/// A drive aspect under introspection
///
/// `id` is `None` for a draft and set by the store on create; it never
/// changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntrospectedEntity {
    pub id: Option<i64>,
    pub instance_id: String,
    pub drive_id: String,
    pub target: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted: bool,
}

impl IntrospectedEntity {
    /// Unsaved entity for `repository.create`
    pub fn draft(
        instance_id: impl Into<String>,
        drive_id: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            instance_id: instance_id.into(),
            drive_id: drive_id.into(),
            target: target.into(),
            created_at: None,
            updated_at: None,
            deleted_at: None,
            deleted: false,
        }
    }

    /// Whether the store has assigned an identity
    pub fn is_created(&self) -> bool {
        self.id.is_some()
    }

    /// Same (instance, drive, target) triple
    pub fn matches(&self, instance_id: &str, drive_id: &str, target: &str) -> bool {
        self.instance_id == instance_id && self.drive_id == drive_id && self.target == target
    }

    pub(crate) fn to_new(&self) -> NewEntity {
        NewEntity {
            instance_id: self.instance_id.clone(),
            drive_id: self.drive_id.clone(),
            introspection_target: self.target.clone(),
        }
    }
}

impl From<EntityRecord> for IntrospectedEntity {
    fn from(record: EntityRecord) -> Self {
        Self {
            id: Some(record.id),
            instance_id: record.instance_id,
            drive_id: record.drive_id,
            target: record.introspection_target,
            created_at: Some(record.created_at),
            updated_at: record.updated_at,
            deleted_at: record.deleted_at,
            deleted: record.deleted,
        }
    }
}

impl EntityRecord {
    /// Fresh row with bookkeeping stamped now
    pub fn insert(id: i64, values: NewEntity) -> Self {
        Self {
            id,
            instance_id: values.instance_id,
            drive_id: values.drive_id,
            introspection_target: values.introspection_target,
            created_at: Utc::now(),
            updated_at: None,
            deleted_at: None,
            deleted: false,
        }
    }

    /// Mark the row deleted without removing it
    pub fn soft_delete(&mut self) {
        let now = Utc::now();
        self.deleted = true;
        self.deleted_at = Some(now);
        self.updated_at = Some(now);
    }
}
