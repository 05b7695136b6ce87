//! Peerlink provider: the pod lifecycle surface a virtual-node framework calls into.
//!
//! Reads are answered from the dual-sided cache and never fail: an
//! object that cannot be resolved right now is reported as absent. Mutations go through the
//! same [`PodReflector`] the watch loops use. Logs, exec and stats are proxied to the
//! foreign cluster untranslated.

#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Pod, PodStatus};
use metrics::counter;
use peerlink_core::labels::{outgoing_selector, REFLECTED_POD_KEY};
use peerlink_core::{DeltaKind, ResourceKind, Side, TrackedObject};
use peerlink_reflect::{PeeringContext, PodReflector, ReflectError};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use peerlink_ops::{ExecIo, ExecRequest, LogChunk, LogOptions, PodOps, StreamHandle};

mod stats;

pub use stats::{NodeStats, PodStats, StatsSummary};

/// Errors suitable for handing back to the node framework.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum ProviderError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

impl From<ReflectError> for ProviderError {
    fn from(e: ReflectError) -> Self {
        ProviderError::Internal(e.to_string())
    }
}

fn passthrough(e: anyhow::Error) -> ProviderError {
    ProviderError::Internal(format!("{e:#}"))
}

/// Where a delete request comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOrigin {
    /// The framework deleting a home pod.
    Home,
    /// The dangling sweep, handing over a foreign pod without a home counterpart.
    DanglingSweep,
}

/// Pod lifecycle operations of a virtual node.
#[async_trait::async_trait]
pub trait PodLifecycle: Send + Sync {
    async fn create_pod(&self, pod: &Pod) -> ProviderResult<()>;

    async fn update_pod(&self, pod: &Pod) -> ProviderResult<()>;

    async fn delete_pod(&self, pod: &Pod, origin: DeleteOrigin) -> ProviderResult<()>;

    fn get_pod(&self, namespace: &str, name: &str) -> Option<Pod>;

    fn get_pod_status(&self, namespace: &str, name: &str) -> Option<PodStatus>;

    fn get_pods(&self) -> Vec<Pod>;

    async fn run_in_container(&self, namespace: &str, name: &str, req: ExecRequest, io: ExecIo) -> ProviderResult<()>;

    async fn get_container_logs(&self, namespace: &str, name: &str, opts: LogOptions) -> ProviderResult<StreamHandle<LogChunk>>;

    async fn get_stats_summary(&self) -> ProviderResult<StatsSummary>;
}

/// In-process provider for one peering.
pub struct Provider {
    ctx: PeeringContext,
    pods: Arc<PodReflector>,
    ops: Arc<dyn PodOps>,
}

impl Provider {
    /// `ops` must be bound to the foreign cluster.
    pub fn new(ctx: PeeringContext, ops: Arc<dyn PodOps>) -> Self {
        let pods = PodReflector::new(ctx.clone());
        Self { ctx, pods, ops }
    }

    pub fn context(&self) -> &PeeringContext {
        &self.ctx
    }

    /// Cached foreign pod reflecting home pod `namespace/name`.
    fn foreign_pod(&self, namespace: &str, name: &str) -> Option<Arc<TrackedObject>> {
        let foreign_ns = self.ctx.nat.nat_namespace(namespace, false).ok()?;
        self.ctx.cache.find_by_label(Side::Foreign, ResourceKind::Pod, &foreign_ns, REFLECTED_POD_KEY, name).into_iter().next()
    }

    fn require_foreign_pod(&self, namespace: &str, name: &str) -> ProviderResult<(String, String)> {
        self.foreign_pod(namespace, name)
            .map(|p| (p.namespace().to_string(), p.name().to_string()))
            .ok_or_else(|| ProviderError::NotFound(format!("{namespace}/{name}")))
    }

    /// Invoke `callback` with the home-shaped pod every time a reflected foreign pod changes.
    pub fn notify_pods<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(Pod) + Send + Sync + 'static,
    {
        let ctx = self.ctx.clone();
        self.ctx.cache.on_change(ResourceKind::Pod, move |delta| {
            if delta.side != Side::Foreign || delta.kind != DeltaKind::Applied {
                return;
            }
            if let Some(pod) = home_view(&ctx, &delta.object) {
                callback(pod);
            }
        })
    }

    /// Delete the ReplicaSets of foreign pods whose home pod no longer exists.
    /// Returns how many were removed.
    pub async fn sweep_dangling(&self) -> ProviderResult<usize> {
        let mut removed = 0;
        for foreign in self.ctx.cache.list_all(Side::Foreign, ResourceKind::Pod) {
            let Some(home_name) = foreign.label(REFLECTED_POD_KEY) else {
                continue;
            };
            let Ok(home_ns) = self.ctx.nat.de_nat_namespace(foreign.namespace()) else {
                continue;
            };
            // The cache may not have caught up yet; ask the home cluster.
            let alive = self.ctx.home.get(ResourceKind::Pod, &home_ns, home_name).await.map_err(ReflectError::from)?;
            if alive.is_some() {
                continue;
            }
            let Some(pod) = foreign.as_pod() else {
                continue;
            };
            info!(ns = %foreign.namespace(), name = %foreign.name(), home = %home_name, "dangling foreign pod");
            self.delete_pod(pod, DeleteOrigin::DanglingSweep).await?;
            removed += 1;
        }
        counter!("peerlink_dangling_swept_total", removed as u64);
        Ok(removed)
    }
}

/// Home-shaped view of a cached foreign pod.
fn home_view(ctx: &PeeringContext, foreign: &TrackedObject) -> Option<Pod> {
    let pod = foreign.as_pod()?;
    let home_name = foreign.label(REFLECTED_POD_KEY)?;
    let home_ns = ctx.nat.de_nat_namespace(foreign.namespace()).ok()?;
    let cached = ctx.cache.get_by_side(Side::Home, ResourceKind::Pod, &home_ns, home_name).ok();
    match ctx.forge.home_pod_for(pod, cached.as_deref().and_then(TrackedObject::as_pod)) {
        Ok(p) => Some(p),
        Err(e) => {
            debug!(ns = %foreign.namespace(), name = %foreign.name(), error = %e, "foreign pod not translatable");
            None
        }
    }
}

#[async_trait::async_trait]
impl PodLifecycle for Provider {
    async fn create_pod(&self, pod: &Pod) -> ProviderResult<()> {
        let obj = TrackedObject::Pod(pod.clone());
        let outcome = self.pods.ensure_reflected(&obj).await?;
        debug!(ns = %obj.namespace(), name = %obj.name(), outcome = outcome.as_str(), "create pod");
        Ok(())
    }

    async fn update_pod(&self, pod: &Pod) -> ProviderResult<()> {
        // Specs are immutable once delegated; only status flows back.
        debug!(
            ns = pod.metadata.namespace.as_deref().unwrap_or_default(),
            name = pod.metadata.name.as_deref().unwrap_or_default(),
            "update pod ignored"
        );
        Ok(())
    }

    async fn delete_pod(&self, pod: &Pod, origin: DeleteOrigin) -> ProviderResult<()> {
        let obj = TrackedObject::Pod(pod.clone());
        let (foreign_ns, rs_name) = match origin {
            DeleteOrigin::Home => match self.ctx.nat.nat_namespace(obj.namespace(), false) {
                Ok(ns) => (ns, obj.name().to_string()),
                Err(_) => {
                    debug!(ns = %obj.namespace(), name = %obj.name(), "namespace never reflected, nothing to delete");
                    return Ok(());
                }
            },
            DeleteOrigin::DanglingSweep => match obj.label(REFLECTED_POD_KEY) {
                Some(home_name) => (obj.namespace().to_string(), home_name.to_string()),
                None => {
                    warn!(ns = %obj.namespace(), name = %obj.name(), "dangling pod without back-reference left alone");
                    return Ok(());
                }
            },
        };
        self.pods.delete_replicaset(&foreign_ns, &rs_name).await?;
        Ok(())
    }

    fn get_pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        let foreign = self.foreign_pod(namespace, name)?;
        home_view(&self.ctx, &foreign)
    }

    fn get_pod_status(&self, namespace: &str, name: &str) -> Option<PodStatus> {
        self.foreign_pod(namespace, name)?.as_pod()?.status.clone()
    }

    fn get_pods(&self) -> Vec<Pod> {
        self.ctx.cache.list_all(Side::Foreign, ResourceKind::Pod).iter().filter_map(|p| home_view(&self.ctx, p)).collect()
    }

    async fn run_in_container(&self, namespace: &str, name: &str, req: ExecRequest, io: ExecIo) -> ProviderResult<()> {
        let (ns, pod) = self.require_foreign_pod(namespace, name)?;
        info!(ns = %ns, pod = %pod, cmd = ?req.command, "exec");
        self.ops.exec(&ns, &pod, req, io).await.map_err(passthrough)
    }

    async fn get_container_logs(&self, namespace: &str, name: &str, opts: LogOptions) -> ProviderResult<StreamHandle<LogChunk>> {
        let (ns, pod) = self.require_foreign_pod(namespace, name)?;
        self.ops.logs(&ns, &pod, opts).await.map_err(passthrough)
    }

    async fn get_stats_summary(&self) -> ProviderResult<StatsSummary> {
        let selector = outgoing_selector(&self.ctx.cfg.virtual_node_name);
        let mut summary = StatsSummary::new(&self.ctx.cfg.virtual_node_name);
        for (home_ns, foreign_ns) in self.ctx.nat.mapped_namespaces() {
            let usage = self.ops.pod_metrics(&foreign_ns, &selector).await.map_err(passthrough)?;
            for u in usage {
                let Ok(foreign) = self.ctx.cache.get_by_side(Side::Foreign, ResourceKind::Pod, &foreign_ns, &u.name) else {
                    continue;
                };
                let Some(home_name) = foreign.label(REFLECTED_POD_KEY) else {
                    continue;
                };
                summary.push(PodStats::attributed(&home_ns, home_name, u));
            }
        }
        Ok(summary)
    }
}
