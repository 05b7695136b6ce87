//! Home pods delegated to the virtual node ↔ foreign single-replica ReplicaSets.
//!
//! Deletion is finalizer-gated: the home pod keeps [`HOME_POD_FINALIZER`] until the foreign
//! ReplicaSet is confirmed absent.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use peerlink_core::labels::{HOME_POD_FINALIZER, REFLECTED_POD_KEY};
use peerlink_core::{Delta, DeltaKind, ResourceKind, Side, TrackedObject};
use peerlink_forge::is_daemonset_owned;
use peerlink_kubehub::{add_finalizer, remove_finalizer};
use tracing::{debug, info};

use crate::{tolerate_not_found, Outcome, PeeringContext, Reflect, ReflectError};

pub struct PodReflector {
    ctx: PeeringContext,
}

impl PodReflector {
    pub fn new(ctx: PeeringContext) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    /// Make sure `pod` is finalized on the home side and has its foreign ReplicaSet.
    /// Safe to replay: an existing ReplicaSet or finalizer is left as is.
    pub async fn ensure_reflected(&self, pod_obj: &TrackedObject) -> Result<Outcome, ReflectError> {
        let Some(pod) = pod_obj.as_pod() else {
            return Ok(Outcome::Skipped);
        };
        let Some(desired) = self.ctx.forge.replicaset_for(pod)? else {
            debug!(ns = %pod_obj.namespace(), name = %pod_obj.name(), "daemonset pod not delegated");
            return Ok(Outcome::Skipped);
        };

        // Finalizer before the foreign write: a crash in between leaves a finalized pod
        // without a ReplicaSet, which the next pass repairs.
        add_finalizer(&*self.ctx.home, pod_obj, HOME_POD_FINALIZER).await?;

        let foreign_ns = desired.metadata.namespace.clone().unwrap_or_default();
        let name = pod_obj.name();
        match self.ctx.cache.get_by_side(Side::Foreign, ResourceKind::ReplicaSet, &foreign_ns, name) {
            Ok(current) => self.refresh(&current, desired).await,
            Err(_) => match self.ctx.foreign.create(&TrackedObject::ReplicaSet(desired)).await {
                Ok(_) => {
                    info!(ns = %foreign_ns, name = %name, "foreign replicaset created");
                    Ok(Outcome::Created)
                }
                Err(e) if e.is_already_exists() => {
                    debug!(ns = %foreign_ns, name = %name, "foreign replicaset already exists");
                    Ok(Outcome::Unchanged)
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    async fn refresh(&self, current: &TrackedObject, desired: ReplicaSet) -> Result<Outcome, ReflectError> {
        let Some(rs) = current.as_replica_set() else {
            return Ok(Outcome::Skipped);
        };
        if !template_drifted(&desired, rs) {
            return Ok(Outcome::Unchanged);
        }
        let mut next = rs.clone();
        next.metadata.labels = desired.metadata.labels;
        if let (Some(spec), Some(want)) = (next.spec.as_mut(), desired.spec) {
            spec.template = want.template;
        }
        match self.ctx.foreign.update(&TrackedObject::ReplicaSet(next)).await {
            Ok(_) => Ok(Outcome::Updated),
            Err(e) if e.is_not_found() => {
                // Gone under us; drop the stale entry so the next pass creates it.
                self.ctx.cache.invalidate(Side::Foreign, ResourceKind::ReplicaSet, current.namespace(), current.name());
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the foreign ReplicaSet of a terminating home pod, then release the home pod.
    pub async fn finalize(&self, pod_obj: &TrackedObject) -> Result<Outcome, ReflectError> {
        let (ns, name) = (pod_obj.namespace(), pod_obj.name());
        let foreign_ns = self.ctx.nat.nat_namespace(ns, true)?;
        let deleted = tolerate_not_found(self.ctx.foreign.delete(ResourceKind::ReplicaSet, &foreign_ns, name).await)?;
        if deleted {
            debug!(ns = %foreign_ns, name = %name, "foreign replicaset deletion requested");
        }
        if self.ctx.foreign.get(ResourceKind::ReplicaSet, &foreign_ns, name).await?.is_some() {
            debug!(ns = %ns, name = %name, "foreign replicaset still present, keeping finalizer");
            return Ok(Outcome::Deferred);
        }
        let Some(fresh) = self.ctx.home.get(ResourceKind::Pod, ns, name).await? else {
            return Ok(Outcome::Unchanged);
        };
        match remove_finalizer(&*self.ctx.home, &fresh, HOME_POD_FINALIZER).await {
            Ok(Some(_)) => {
                info!(ns = %ns, name = %name, "home pod finalizer removed");
                Ok(Outcome::Finalized)
            }
            Ok(None) => Ok(Outcome::Unchanged),
            Err(e) if e.is_not_found() => Ok(Outcome::Unchanged),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the foreign ReplicaSet `name` in `foreign_ns`, tolerating its absence.
    pub async fn delete_replicaset(&self, foreign_ns: &str, name: &str) -> Result<Outcome, ReflectError> {
        if tolerate_not_found(self.ctx.foreign.delete(ResourceKind::ReplicaSet, foreign_ns, name).await)? {
            info!(ns = %foreign_ns, name = %name, "foreign replicaset deleted");
            Ok(Outcome::Deleted)
        } else {
            debug!(ns = %foreign_ns, name = %name, "foreign replicaset already absent");
            Ok(Outcome::Unchanged)
        }
    }

    async fn home_pod_changed(&self, pod_obj: &TrackedObject) -> Result<Outcome, ReflectError> {
        if pod_obj.as_pod().is_some_and(is_daemonset_owned) {
            return Ok(Outcome::Skipped);
        }
        if pod_obj.is_terminating() {
            if !pod_obj.has_finalizer(HOME_POD_FINALIZER) {
                return Ok(Outcome::Skipped);
            }
            return self.finalize(pod_obj).await;
        }
        self.ensure_reflected(pod_obj).await
    }

    /// The home pod is gone for good; clean up a ReplicaSet that outlived it.
    async fn home_pod_gone(&self, pod_obj: &TrackedObject) -> Result<Outcome, ReflectError> {
        let Ok(foreign_ns) = self.ctx.nat.nat_namespace(pod_obj.namespace(), false) else {
            return Ok(Outcome::Skipped);
        };
        if self.ctx.cache.get_by_side(Side::Foreign, ResourceKind::ReplicaSet, &foreign_ns, pod_obj.name()).is_err() {
            return Ok(Outcome::Unchanged);
        }
        self.delete_replicaset(&foreign_ns, pod_obj.name()).await
    }

    fn home_pod_for(&self, rs: &TrackedObject) -> Option<Arc<TrackedObject>> {
        let home_ns = self.ctx.nat.de_nat_namespace(rs.namespace()).ok()?;
        let name = rs.label(REFLECTED_POD_KEY).unwrap_or(rs.name());
        self.ctx.cache.get_by_side(Side::Home, ResourceKind::Pod, &home_ns, name).ok()
    }

    async fn foreign_rs_changed(&self, rs: &TrackedObject) -> Result<Outcome, ReflectError> {
        match self.home_pod_for(rs) {
            Some(pod) if pod.is_terminating() && pod.has_finalizer(HOME_POD_FINALIZER) => self.finalize(&pod).await,
            _ => Ok(Outcome::Unchanged),
        }
    }

    async fn foreign_rs_gone(&self, rs: &TrackedObject) -> Result<Outcome, ReflectError> {
        let Some(pod) = self.home_pod_for(rs) else {
            return Ok(Outcome::Skipped);
        };
        if pod.is_terminating() {
            if pod.has_finalizer(HOME_POD_FINALIZER) {
                return self.finalize(&pod).await;
            }
            return Ok(Outcome::Unchanged);
        }
        info!(ns = %pod.namespace(), name = %pod.name(), "foreign replicaset vanished, recreating");
        self.ensure_reflected(&pod).await
    }
}

/// Fields of the pod template a home-side change can legitimately alter.
fn template_drifted(desired: &ReplicaSet, current: &ReplicaSet) -> bool {
    let template = |rs: &ReplicaSet| rs.spec.as_ref().and_then(|s| s.template.clone());
    let (Some(want), Some(have)) = (template(desired), template(current)) else {
        return true;
    };
    let labels = |t: &k8s_openapi::api::core::v1::PodTemplateSpec| t.metadata.as_ref().and_then(|m| m.labels.clone());
    let containers = |t: &k8s_openapi::api::core::v1::PodTemplateSpec| {
        t.spec
            .as_ref()
            .map(|s| s.containers.iter().map(|c| (c.name.clone(), c.image.clone(), c.env.clone())).collect::<Vec<_>>())
    };
    labels(&want) != labels(&have) || containers(&want) != containers(&have)
}

#[async_trait]
impl Reflect for PodReflector {
    fn name(&self) -> &'static str {
        "pods"
    }

    fn sources(&self) -> Vec<(Side, ResourceKind)> {
        vec![(Side::Home, ResourceKind::Pod), (Side::Foreign, ResourceKind::ReplicaSet)]
    }

    async fn reconcile(&self, delta: &Delta) -> Result<Outcome, ReflectError> {
        let obj = &*delta.object;
        match (delta.side, obj.kind(), delta.kind) {
            (Side::Home, ResourceKind::Pod, DeltaKind::Applied) => self.home_pod_changed(obj).await,
            (Side::Home, ResourceKind::Pod, DeltaKind::Deleted) => self.home_pod_gone(obj).await,
            (Side::Foreign, ResourceKind::ReplicaSet, DeltaKind::Applied) => self.foreign_rs_changed(obj).await,
            (Side::Foreign, ResourceKind::ReplicaSet, DeltaKind::Deleted) => self.foreign_rs_gone(obj).await,
            _ => Ok(Outcome::Skipped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_forge::replicaset_from_pod;
    use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};

    fn pod(image: &str) -> Pod {
        let mut p = Pod::default();
        p.metadata.name = Some("a".into());
        p.metadata.namespace = Some("web".into());
        p.spec = Some(PodSpec { containers: vec![Container { name: "c".into(), image: Some(image.into()), ..Default::default() }], ..Default::default() });
        p
    }

    #[test]
    fn drift_detects_image_changes_only() {
        let a = replicaset_from_pod(&pod("nginx:1"), "web-h", "vk-f").unwrap();
        let mut b = a.clone();
        b.metadata.resource_version = Some("7".into());
        assert!(!template_drifted(&a, &b));
        let c = replicaset_from_pod(&pod("nginx:2"), "web-h", "vk-f").unwrap();
        assert!(template_drifted(&c, &a));
    }
}
