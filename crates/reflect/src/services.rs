use std::sync::Arc;

use async_trait::async_trait;
use peerlink_core::labels::REFLECTION_KEY;
use peerlink_core::{Delta, DeltaKind, ResourceKind, Side, TrackedObject};
use tracing::{debug, info};

use crate::{tolerate_not_found, Outcome, PeeringContext, Reflect, ReflectError};

/// Home Services → foreign Services, create-if-absent and delete-if-ours.
pub struct ServiceReflector {
    ctx: PeeringContext,
}

impl ServiceReflector {
    pub fn new(ctx: PeeringContext) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    fn is_reflected(obj: &TrackedObject) -> bool {
        obj.label(REFLECTION_KEY).is_some()
    }

    async fn applied(&self, obj: &TrackedObject) -> Result<Outcome, ReflectError> {
        let Some(svc) = obj.as_service() else {
            return Ok(Outcome::Skipped);
        };
        if Self::is_reflected(obj) {
            return Ok(Outcome::Skipped);
        }
        let foreign_ns = match self.ctx.nat.nat_namespace(obj.namespace(), false) {
            Ok(ns) => ns,
            Err(e) if !e.is_configuration_defect() => return Ok(Outcome::Skipped),
            Err(e) => return Err(e.into()),
        };
        let existing = self.ctx.cache.get_by_side(Side::Foreign, ResourceKind::Service, &foreign_ns, obj.name()).ok();
        let existing = existing.as_deref().and_then(TrackedObject::as_service);
        let Some(desired) = self.ctx.forge.service_for(svc, existing)? else {
            return Ok(Outcome::Unchanged);
        };
        match self.ctx.foreign.create(&TrackedObject::Service(desired)).await {
            Ok(_) => {
                info!(ns = %foreign_ns, name = %obj.name(), "foreign service created");
                Ok(Outcome::Created)
            }
            Err(e) if e.is_already_exists() => Ok(Outcome::Unchanged),
            Err(e) => Err(e.into()),
        }
    }

    async fn deleted(&self, obj: &TrackedObject) -> Result<Outcome, ReflectError> {
        if Self::is_reflected(obj) {
            return Ok(Outcome::Skipped);
        }
        let Ok(foreign_ns) = self.ctx.nat.nat_namespace(obj.namespace(), false) else {
            return Ok(Outcome::Skipped);
        };
        let Some(current) = self.ctx.foreign.get(ResourceKind::Service, &foreign_ns, obj.name()).await? else {
            return Ok(Outcome::Unchanged);
        };
        if current.label(REFLECTION_KEY) != Some(self.ctx.cfg.home_cluster_id.as_str()) {
            debug!(ns = %foreign_ns, name = %obj.name(), "foreign service not ours, left alone");
            return Ok(Outcome::Skipped);
        }
        if tolerate_not_found(self.ctx.foreign.delete(ResourceKind::Service, &foreign_ns, obj.name()).await)? {
            info!(ns = %foreign_ns, name = %obj.name(), "foreign service deleted");
            Ok(Outcome::Deleted)
        } else {
            Ok(Outcome::Unchanged)
        }
    }
}

#[async_trait]
impl Reflect for ServiceReflector {
    fn name(&self) -> &'static str {
        "services"
    }

    fn sources(&self) -> Vec<(Side, ResourceKind)> {
        vec![(Side::Home, ResourceKind::Service)]
    }

    async fn reconcile(&self, delta: &Delta) -> Result<Outcome, ReflectError> {
        match (delta.side, delta.kind) {
            (Side::Home, DeltaKind::Applied) => self.applied(&delta.object).await,
            (Side::Home, DeltaKind::Deleted) => self.deleted(&delta.object).await,
            _ => Ok(Outcome::Skipped),
        }
    }
}
