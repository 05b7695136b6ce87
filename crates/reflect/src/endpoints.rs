//! Endpoints reflection in one direction, plus optional EndpointSlice generation on the
//! destination side.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use peerlink_core::labels::{ENDPOINT_SLICE_MANAGED_BY, ENDPOINT_SLICE_MANAGED_BY_KEY, REFLECTION_KEY};
use peerlink_core::{Delta, DeltaKind, EndpointsDirection, ResourceKind, Side, TrackedObject};
use peerlink_forge::endpoints_equivalent;
use tracing::{debug, info};

use crate::{tolerate_not_found, Outcome, PeeringContext, Reflect, ReflectError};

pub struct EndpointsReflector {
    ctx: PeeringContext,
    direction: EndpointsDirection,
}

impl EndpointsReflector {
    pub fn new(ctx: PeeringContext, direction: EndpointsDirection) -> Arc<Self> {
        Arc::new(Self { ctx, direction })
    }

    fn source(&self) -> Side {
        self.direction.source()
    }

    fn destination(&self) -> Side {
        self.direction.destination()
    }

    fn dest_namespace(&self, source_ns: &str) -> Option<String> {
        self.ctx.counterpart_namespace(self.source(), source_ns, false).ok()
    }

    async fn source_applied(&self, obj: &TrackedObject) -> Result<Outcome, ReflectError> {
        let Some(source) = obj.as_endpoints() else {
            return Ok(Outcome::Skipped);
        };
        // Labels alone say nothing here: the cluster copies a reflected Service's labels onto
        // its Endpoints. Reflected Endpoints carry no node bindings, so the address filter
        // keeps them from coming back.
        let Some(dest_ns) = self.dest_namespace(obj.namespace()) else {
            return Ok(Outcome::Skipped);
        };
        let dst = self.destination();
        let Ok(service) = self.ctx.cache.get_by_side(dst, ResourceKind::Service, &dest_ns, obj.name()) else {
            debug!(side = %dst, ns = %dest_ns, name = %obj.name(), "destination service not observed yet");
            return Ok(Outcome::Deferred);
        };

        let Some(desired) = self.ctx.forge.endpoints_for(source, self.source(), &dest_ns) else {
            return Ok(Outcome::Unchanged);
        };
        let outcome = self.upsert_endpoints(desired).await?;

        if self.ctx.cfg.endpoint_slices {
            if let Some(svc) = service.as_service() {
                if let Some(slice) = self.ctx.forge.endpoint_slice_for(svc, source)? {
                    self.upsert_slice(slice).await?;
                }
            }
        }
        Ok(outcome)
    }

    async fn upsert_endpoints(&self, desired: Endpoints) -> Result<Outcome, ReflectError> {
        let dst = self.destination();
        let api = self.ctx.cluster(dst);
        let ns = desired.metadata.namespace.clone().unwrap_or_default();
        let name = desired.metadata.name.clone().unwrap_or_default();

        let current = match self.ctx.cache.get_by_side(dst, ResourceKind::Endpoints, &ns, &name) {
            Ok(obj) => Some(obj),
            Err(_) => match api.create(&TrackedObject::Endpoints(desired.clone())).await {
                Ok(_) => {
                    info!(side = %dst, ns = %ns, name = %name, "endpoints created");
                    return Ok(Outcome::Created);
                }
                Err(e) if e.is_already_exists() => {
                    // Cache lags the cluster; take the live object and compare against it.
                    let fresh = api.get(ResourceKind::Endpoints, &ns, &name).await?;
                    self.ctx.cache.reseed(dst, ResourceKind::Endpoints, &ns, &name, fresh.clone());
                    fresh.map(Arc::new)
                }
                Err(e) => return Err(e.into()),
            },
        };
        let Some(current) = current else {
            return Ok(Outcome::Deferred);
        };
        let Some(existing) = current.as_endpoints() else {
            return Ok(Outcome::Skipped);
        };
        if endpoints_equivalent(&desired, existing) {
            return Ok(Outcome::Unchanged);
        }

        let mut next = existing.clone();
        next.subsets = desired.subsets;
        next.metadata.labels.get_or_insert_with(Default::default).extend(desired.metadata.labels.unwrap_or_default());
        match api.update(&TrackedObject::Endpoints(next)).await {
            Ok(_) => {
                debug!(side = %dst, ns = %ns, name = %name, "endpoints updated");
                Ok(Outcome::Updated)
            }
            Err(e) if e.is_not_found() => {
                self.ctx.cache.invalidate(dst, ResourceKind::Endpoints, &ns, &name);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn upsert_slice(&self, desired: EndpointSlice) -> Result<(), ReflectError> {
        let dst = self.destination();
        let api = self.ctx.cluster(dst);
        let ns = desired.metadata.namespace.clone().unwrap_or_default();
        let name = desired.metadata.name.clone().unwrap_or_default();
        match self.ctx.cache.get_by_side(dst, ResourceKind::EndpointSlice, &ns, &name) {
            Ok(current) => {
                let Some(existing) = current.as_endpoint_slice() else {
                    return Ok(());
                };
                if existing.endpoints == desired.endpoints && existing.ports == desired.ports {
                    return Ok(());
                }
                let mut next = existing.clone();
                next.endpoints = desired.endpoints;
                next.ports = desired.ports;
                api.update(&TrackedObject::EndpointSlice(next)).await?;
                debug!(side = %dst, ns = %ns, name = %name, "endpointslice updated");
            }
            Err(_) => match api.create(&TrackedObject::EndpointSlice(desired)).await {
                Ok(_) => info!(side = %dst, ns = %ns, name = %name, "endpointslice created"),
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(())
    }

    async fn source_deleted(&self, obj: &TrackedObject) -> Result<Outcome, ReflectError> {
        let Some(dest_ns) = self.dest_namespace(obj.namespace()) else {
            return Ok(Outcome::Skipped);
        };
        let api = self.ctx.cluster(self.destination());
        let mut outcome = Outcome::Unchanged;
        if let Some(current) = api.get(ResourceKind::Endpoints, &dest_ns, obj.name()).await? {
            let origin = self.ctx.cfg.cluster_id(self.source());
            if current.label(REFLECTION_KEY) == Some(origin) && tolerate_not_found(api.delete(ResourceKind::Endpoints, &dest_ns, obj.name()).await)? {
                info!(side = %self.destination(), ns = %dest_ns, name = %obj.name(), "endpoints deleted");
                outcome = Outcome::Deleted;
            }
        }
        if let Some(slice) = api.get(ResourceKind::EndpointSlice, &dest_ns, obj.name()).await? {
            if slice.label(ENDPOINT_SLICE_MANAGED_BY_KEY) == Some(ENDPOINT_SLICE_MANAGED_BY) {
                tolerate_not_found(api.delete(ResourceKind::EndpointSlice, &dest_ns, obj.name()).await)?;
            }
        }
        Ok(outcome)
    }

    /// The destination Service showed up or changed: replay the cached source Endpoints.
    async fn destination_service_applied(&self, svc: &TrackedObject) -> Result<Outcome, ReflectError> {
        let Ok(source_ns) = self.ctx.counterpart_namespace(self.destination(), svc.namespace(), false) else {
            return Ok(Outcome::Skipped);
        };
        match self.ctx.cache.get_by_side(self.source(), ResourceKind::Endpoints, &source_ns, svc.name()) {
            Ok(source) => self.source_applied(&source).await,
            Err(_) => Ok(Outcome::Unchanged),
        }
    }
}

#[async_trait]
impl Reflect for EndpointsReflector {
    fn name(&self) -> &'static str {
        match self.direction {
            EndpointsDirection::ForeignToHome => "endpoints-foreign-to-home",
            EndpointsDirection::HomeToForeign => "endpoints-home-to-foreign",
        }
    }

    fn sources(&self) -> Vec<(Side, ResourceKind)> {
        vec![(self.source(), ResourceKind::Endpoints), (self.destination(), ResourceKind::Service)]
    }

    async fn reconcile(&self, delta: &Delta) -> Result<Outcome, ReflectError> {
        let obj = &*delta.object;
        match (obj.kind(), delta.kind) {
            (ResourceKind::Endpoints, DeltaKind::Applied) if delta.side == self.source() => self.source_applied(obj).await,
            (ResourceKind::Endpoints, DeltaKind::Deleted) if delta.side == self.source() => self.source_deleted(obj).await,
            (ResourceKind::Service, DeltaKind::Applied) if delta.side == self.destination() => self.destination_service_applied(obj).await,
            _ => Ok(Outcome::Skipped),
        }
    }
}
