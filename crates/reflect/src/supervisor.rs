//! Peering-scoped owner of every feed and reflector task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context};
use metrics::{counter, histogram};
use peerlink_core::{Delta, ResourceKind, Side};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::feeder::Feed;
use crate::{EndpointsReflector, ErrorClass, PeeringContext, PodReflector, Reflect, ServiceReflector};

/// Reflectors enabled by the peering configuration.
pub struct Reflectors {
    pub pods: Option<Arc<PodReflector>>,
    pub all: Vec<Arc<dyn Reflect>>,
}

impl Reflectors {
    pub fn from_config(ctx: &PeeringContext) -> Self {
        let mut all: Vec<Arc<dyn Reflect>> = Vec::new();
        let pods = ctx.cfg.reflects(ResourceKind::Pod).then(|| PodReflector::new(ctx.clone()));
        if let Some(p) = &pods {
            all.push(p.clone());
        }
        if ctx.cfg.reflects(ResourceKind::Service) {
            all.push(ServiceReflector::new(ctx.clone()));
        }
        if ctx.cfg.reflects(ResourceKind::Endpoints) {
            for dir in &ctx.cfg.endpoints_directions {
                all.push(EndpointsReflector::new(ctx.clone(), *dir));
            }
        }
        Self { pods, all }
    }
}

/// Streams kept in the cache for readers even when no reflector consumes them.
fn cache_only_streams(ctx: &PeeringContext) -> Vec<(Side, ResourceKind)> {
    let mut out = Vec::new();
    if ctx.cfg.reflects(ResourceKind::Pod) {
        // Foreign pods answer status/listing queries; services feed env rewriting.
        out.push((Side::Foreign, ResourceKind::Pod));
        out.push((Side::Home, ResourceKind::Service));
        out.push((Side::Foreign, ResourceKind::Service));
    }
    if ctx.cfg.reflects(ResourceKind::Service) {
        out.push((Side::Foreign, ResourceKind::Service));
    }
    if ctx.cfg.reflects(ResourceKind::Endpoints) {
        for dir in &ctx.cfg.endpoints_directions {
            out.push((dir.destination(), ResourceKind::Endpoints));
            if ctx.cfg.endpoint_slices {
                out.push((dir.destination(), ResourceKind::EndpointSlice));
            }
        }
    }
    out
}

pub struct Supervisor {
    ctx: PeeringContext,
    cancel: CancellationToken,
    tasks: JoinSet<anyhow::Result<()>>,
    pods: Option<Arc<PodReflector>>,
}

impl Supervisor {
    /// Spawn every feed and reflector worker for `ctx`. Must run inside a tokio runtime.
    pub fn start(ctx: PeeringContext) -> Self {
        Self::start_with(ctx, CancellationToken::new())
    }

    pub fn start_with(ctx: PeeringContext, cancel: CancellationToken) -> Self {
        let reflectors = Reflectors::from_config(&ctx);
        let mut tasks = JoinSet::new();
        let mut feeds: BTreeMap<(Side, ResourceKind), Feed> = BTreeMap::new();

        for r in &reflectors.all {
            let (tx, rx) = mpsc::channel::<Delta>(ctx.cfg.queue_cap);
            for (side, kind) in r.sources() {
                feeds.entry((side, kind)).or_insert_with(|| Feed::new(side, kind)).route(tx.clone());
            }
            tasks.spawn(run_worker(Arc::clone(r), rx, cancel.child_token()));
        }
        for (side, kind) in cache_only_streams(&ctx) {
            feeds.entry((side, kind)).or_insert_with(|| Feed::new(side, kind));
        }

        info!(
            home = %ctx.cfg.home_cluster_id,
            foreign = %ctx.cfg.foreign_cluster_id,
            reflectors = reflectors.all.len(),
            feeds = feeds.len(),
            "peering supervisor started"
        );
        for (_, feed) in feeds {
            tasks.spawn(feed.run(ctx.clone(), cancel.child_token()));
        }
        Self { ctx, cancel, tasks, pods: reflectors.pods }
    }

    pub fn context(&self) -> &PeeringContext {
        &self.ctx
    }

    pub fn pods(&self) -> Option<Arc<PodReflector>> {
        self.pods.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Tear the peering down; in-flight API calls finish first.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for all tasks to end. A task ending before cancellation counts as a failure.
    pub async fn wait(mut self) -> anyhow::Result<()> {
        let mut first_err = None;
        while let Some(res) = self.tasks.join_next().await {
            let res = res.context("reflection task panicked").and_then(|r| r);
            let res = match res {
                Ok(()) if !self.cancel.is_cancelled() => Err(anyhow!("reflection task exited before teardown")),
                other => other,
            };
            if let Err(e) = res {
                error!(error = %e, "peering task failed");
                first_err.get_or_insert(e);
            }
        }
        info!("peering supervisor stopped");
        first_err.map_or(Ok(()), Err)
    }
}

/// Consume one reflector's queue in delivery order.
async fn run_worker(reflector: Arc<dyn Reflect>, mut rx: mpsc::Receiver<Delta>, cancel: CancellationToken) -> anyhow::Result<()> {
    let name = reflector.name();
    loop {
        let delta = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(d) => d,
                None => break,
            },
        };
        // Not raced against cancellation: a started write is allowed to complete.
        let t0 = Instant::now();
        let res = reflector.reconcile(&delta).await;
        histogram!("peerlink_reflect_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "reflector" => name);
        let key = delta.object.key();
        match res {
            Ok(outcome) => {
                counter!("peerlink_reflect_ops_total", 1, "reflector" => name, "outcome" => outcome.as_str());
                debug!(reflector = name, side = %delta.side, key = %key, outcome = outcome.as_str(), "reconciled");
            }
            Err(e) => {
                let class = e.class();
                counter!("peerlink_reflect_errors_total", 1, "reflector" => name, "class" => class.as_str());
                match class {
                    ErrorClass::Malformed => warn!(reflector = name, key = %key, error = %e, "malformed object skipped"),
                    ErrorClass::Configuration => error!(reflector = name, key = %key, error = %e, "peering misconfigured"),
                    ErrorClass::NotFound | ErrorClass::AlreadyExists | ErrorClass::Transient => {
                        warn!(reflector = name, key = %key, class = class.as_str(), error = %e, "reconcile failed, waiting for next event")
                    }
                }
            }
        }
    }
    debug!(reflector = name, "reflector worker stopped");
    Ok(())
}
