//! Boundary API for the request-routing layer
//!
//! Validates input, resolves the instance, delegates to the introspection
//! capability or the repository, and turns the result into the JSON views
//! and status codes the router returns.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::compute::InstanceRegistry;
use crate::context::RequestContext;
use crate::driver::IntrospectionCapability;
use crate::error::IntrospectionError;
use crate::store::{EntityRepository, IntrospectedEntity};

/// Boundary-level failure with an HTTP status
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    NotImplemented(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::NotImplemented(_) => 501,
            Self::Internal(_) => 500,
        }
    }
}

impl From<IntrospectionError> for ApiError {
    fn from(err: IntrospectionError) -> Self {
        let message = err.to_string();
        if !err.is_caller_visible() {
            tracing::error!(kind = err.kind(), error = %message, "introspection request failed");
        }
        match err {
            IntrospectionError::NotFound(_) => Self::NotFound(message),
            IntrospectionError::NotImplemented(_) => Self::NotImplemented(message),
            IntrospectionError::Conflict { .. } => Self::Conflict(message),
            _ => Self::Internal(message),
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Body of an activation request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActivateRequest {
    pub drive_id: Option<String>,
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityView {
    pub drive_id: String,
    pub introspected_entity_id: Option<i64>,
    pub target: String,
}

impl From<&IntrospectedEntity> for EntityView {
    fn from(entity: &IntrospectedEntity) -> Self {
        Self {
            drive_id: entity.drive_id.clone(),
            introspected_entity_id: entity.id,
            target: entity.target.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityEnvelope {
    pub introspected_entity: EntityView,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityListEnvelope {
    pub introspected_entities: Vec<EntityView>,
}

/// Request accepted; completion is not reported synchronously (HTTP 202)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted;

impl Accepted {
    pub fn status_code(&self) -> u16 {
        202
    }
}

pub struct IntrospectionApi {
    instances: Arc<dyn InstanceRegistry>,
    repository: EntityRepository,
    capability: Option<Arc<dyn IntrospectionCapability>>,
}

impl IntrospectionApi {
    /// `capability` is `None` when the hypervisor driver cannot introspect
    pub fn new(
        instances: Arc<dyn InstanceRegistry>,
        repository: EntityRepository,
        capability: Option<Arc<dyn IntrospectionCapability>>,
    ) -> Self {
        Self {
            instances,
            repository,
            capability,
        }
    }

    pub async fn activate(
        &self,
        ctx: &RequestContext,
        instance_id: &str,
        request: ActivateRequest,
    ) -> ApiResult<EntityEnvelope> {
        let drive_id = required(request.drive_id, "drive_id")?;
        let target = required(request.target, "target")?;

        let instance = self.instances.get(instance_id)?;
        let capability = self.capability()?;

        crate::trace_log!(info, ctx.trace_id, instance_id, drive_id = %drive_id, target = %target, "activation requested");
        let entity = capability
            .activate_introspection(ctx, &instance, &drive_id, &target)
            .await?;

        Ok(EntityEnvelope {
            introspected_entity: EntityView::from(&entity),
        })
    }

    pub async fn get(
        &self,
        _ctx: &RequestContext,
        instance_id: &str,
        entity_id: i64,
    ) -> ApiResult<EntityEnvelope> {
        self.instances.get(instance_id)?;
        let entity = self.repository.get_by_id(entity_id)?;
        if entity.instance_id != instance_id {
            return Err(ApiError::NotFound(format!(
                "introspected entity {} not found on instance {}",
                entity_id, instance_id
            )));
        }

        Ok(EntityEnvelope {
            introspected_entity: EntityView::from(&entity),
        })
    }

    pub async fn list(&self, _ctx: &RequestContext, instance_id: &str) -> ApiResult<EntityListEnvelope> {
        self.instances.get(instance_id)?;
        let entities = self.repository.list_by_instance(instance_id, true)?;

        Ok(EntityListEnvelope {
            introspected_entities: entities.iter().map(EntityView::from).collect(),
        })
    }

    pub async fn deactivate(
        &self,
        ctx: &RequestContext,
        instance_id: &str,
        entity_id: i64,
    ) -> ApiResult<Accepted> {
        let instance = self.instances.get(instance_id)?;
        let capability = self.capability()?;

        crate::trace_log!(info, ctx.trace_id, instance_id, entity_id, "deactivation requested");
        capability
            .deactivate_introspection(ctx, &instance, entity_id)
            .await?;
        Ok(Accepted)
    }

    fn capability(&self) -> ApiResult<&Arc<dyn IntrospectionCapability>> {
        self.capability.as_ref().ok_or_else(|| {
            ApiError::NotImplemented("hypervisor driver does not support introspection".into())
        })
    }
}

fn required(value: Option<String>, field: &str) -> ApiResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ApiError::BadRequest(format!("{} is required", field))),
    }
}
