//! Introspection capability for hypervisor drivers
//!
//! Rather than extending the full hypervisor driver, introspection is a
//! separate capability wrapped around a base driver. `IntrospectionDriver::detect`
//! only yields a wrapper when the base driver can take monitor commands;
//! callers that get `None` report `NotImplemented`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::compute::Instance;
use crate::context::RequestContext;
use crate::error::Result;
use crate::hypervisor::HypervisorDriver;
use crate::session::SessionManager;
use crate::store::IntrospectedEntity;

#[async_trait]
pub trait IntrospectionCapability: Send + Sync {
    async fn activate_introspection(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        drive_id: &str,
        target: &str,
    ) -> Result<IntrospectedEntity>;

    async fn deactivate_introspection(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        entity_id: i64,
    ) -> Result<()>;
}

/// Base driver plus the session manager that drives it
pub struct IntrospectionDriver {
    base: Arc<dyn HypervisorDriver>,
    sessions: Arc<SessionManager>,
}

impl IntrospectionDriver {
    /// Wrap the session manager's driver if it supports monitor commands
    pub fn detect(sessions: Arc<SessionManager>) -> Option<Self> {
        let base = Arc::clone(sessions.driver());
        if !base.supports_monitor_commands() {
            tracing::warn!(driver = base.name(), "driver has no monitor, introspection disabled");
            return None;
        }
        Some(Self { base, sessions })
    }

    pub fn base(&self) -> &Arc<dyn HypervisorDriver> {
        &self.base
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }
}

#[async_trait]
impl IntrospectionCapability for IntrospectionDriver {
    async fn activate_introspection(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        drive_id: &str,
        target: &str,
    ) -> Result<IntrospectedEntity> {
        self.sessions.activate(ctx, instance, drive_id, target).await
    }

    async fn deactivate_introspection(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        entity_id: i64,
    ) -> Result<()> {
        self.sessions.deactivate(ctx, instance, entity_id).await
    }
}

impl std::fmt::Debug for IntrospectionDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntrospectionDriver")
            .field("base", &self.base.name())
            .field("sessions", &self.sessions)
            .finish()
    }
}
