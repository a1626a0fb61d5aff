//! Compute instances
//!
//! The introspection layer never owns VMs; it only needs to resolve an
//! instance id to the hypervisor domain that runs it.

use std::collections::BTreeMap;

use crate::error::{IntrospectionError, Result};

/// A running virtual machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Stable instance identifier (UUID in most deployments)
    pub uuid: String,
    /// Hypervisor domain name
    pub domain_name: String,
}

/// Lookup collaborator for instances
pub trait InstanceRegistry: Send + Sync {
    /// # Errors
    /// * `NotFound` - no such instance
    fn get(&self, instance_id: &str) -> Result<Instance>;
}

/// Registry backed by the `[instances]` configuration table
#[derive(Debug, Clone, Default)]
pub struct StaticInstanceRegistry {
    domains: BTreeMap<String, String>,
}

impl StaticInstanceRegistry {
    pub fn new(domains: BTreeMap<String, String>) -> Self {
        Self { domains }
    }

    pub fn insert(&mut self, instance_id: impl Into<String>, domain_name: impl Into<String>) {
        self.domains.insert(instance_id.into(), domain_name.into());
    }
}

impl InstanceRegistry for StaticInstanceRegistry {
    fn get(&self, instance_id: &str) -> Result<Instance> {
        self.domains
            .get(instance_id)
            .map(|domain| Instance {
                uuid: instance_id.to_string(),
                domain_name: domain.clone(),
            })
            .ok_or_else(|| IntrospectionError::NotFound(format!("instance {}", instance_id)))
    }
}
