//! Watch consumption: one long-lived task per `(side, kind)`.
//!
//! Each event is admitted (namespace / node scoping), written to the cache and routed to the
//! reflectors that consume that stream. A relist is replayed in full so reflectors get a
//! chance to retry whatever failed before the reconnect.

use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use peerlink_core::labels::{outgoing_selector, ENDPOINT_SLICE_MANAGED_BY, ENDPOINT_SLICE_MANAGED_BY_KEY};
use peerlink_core::{Delta, DeltaKind, ResourceKind, Side, TrackedObject};
use peerlink_kubehub::{WatchEvent, WatchFilter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::PeeringContext;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

pub struct Feed {
    pub side: Side,
    pub kind: ResourceKind,
    routes: Vec<mpsc::Sender<Delta>>,
}

impl Feed {
    pub fn new(side: Side, kind: ResourceKind) -> Self {
        Self { side, kind, routes: Vec::new() }
    }

    pub fn route(&mut self, tx: mpsc::Sender<Delta>) {
        self.routes.push(tx);
    }

    /// Server-side scoping of the watch.
    pub fn filter(&self, ctx: &PeeringContext) -> WatchFilter {
        match (self.side, self.kind) {
            (Side::Home, ResourceKind::Pod) => WatchFilter::fields(format!("spec.nodeName={}", ctx.cfg.virtual_node_name)),
            (Side::Foreign, ResourceKind::Pod | ResourceKind::ReplicaSet) => WatchFilter::labels(outgoing_selector(&ctx.cfg.virtual_node_name)),
            (_, ResourceKind::EndpointSlice) => WatchFilter::labels(format!("{}={}", ENDPOINT_SLICE_MANAGED_BY_KEY, ENDPOINT_SLICE_MANAGED_BY)),
            _ => WatchFilter::default(),
        }
    }

    /// Home pods are scoped by node; everything else by the namespace table, so those
    /// watches relist whenever a namespace gets mapped.
    fn follows_nat(&self) -> bool {
        !matches!((self.side, self.kind), (Side::Home, ResourceKind::Pod))
    }

    fn admits(&self, ctx: &PeeringContext, obj: &TrackedObject) -> bool {
        if obj.kind() != self.kind {
            return false;
        }
        !self.follows_nat() || ctx.is_mapped(self.side, obj.namespace())
    }

    async fn dispatch(&self, delta: Delta) {
        for tx in &self.routes {
            if tx.send(delta.clone()).await.is_err() {
                debug!(side = %self.side, kind = %self.kind, "reflector queue closed");
            }
        }
    }

    async fn handle(&self, ctx: &PeeringContext, ev: WatchEvent) {
        match ev {
            WatchEvent::Applied(obj) => {
                if !self.admits(ctx, &obj) {
                    return;
                }
                if let Some(delta) = ctx.cache.apply(self.side, obj) {
                    self.dispatch(delta).await;
                }
            }
            WatchEvent::Deleted(obj) => {
                if !self.admits(ctx, &obj) {
                    return;
                }
                ctx.cache.remove(self.side, &obj);
                self.dispatch(Delta::deleted(self.side, obj)).await;
            }
            WatchEvent::Restarted(objs) => {
                let admitted: Vec<TrackedObject> = objs.into_iter().filter(|o| self.admits(ctx, o)).collect();
                info!(side = %self.side, kind = %self.kind, objects = admitted.len(), "relisted");
                let changes = ctx.cache.replace(self.side, self.kind, admitted);
                for d in changes.into_iter().filter(|d| d.kind == DeltaKind::Deleted) {
                    self.dispatch(d).await;
                }
                for obj in ctx.cache.list_all(self.side, self.kind) {
                    self.dispatch(Delta::applied(self.side, obj)).await;
                }
            }
        }
    }

    /// Consume the watch until cancelled, reconnecting with capped exponential backoff.
    pub async fn run(self, ctx: PeeringContext, cancel: CancellationToken) -> anyhow::Result<()> {
        let api = ctx.cluster(self.side).clone();
        let filter = self.filter(&ctx);
        let mut epoch = ctx.nat.subscribe();
        let mut nat_live = self.follows_nat();
        let max_backoff = Duration::from_secs(ctx.cfg.watch_backoff_max_secs.max(1));
        let mut backoff = INITIAL_BACKOFF;
        info!(cluster = %api.name(), side = %self.side, kind = %self.kind, "watch feed starting");

        'outer: loop {
            let mut stream = api.watch(self.kind, &filter);
            let _ = epoch.borrow_and_update();
            let mut remapped = false;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break 'outer,
                    changed = epoch.changed(), if nat_live => {
                        if changed.is_err() {
                            nat_live = false;
                            continue;
                        }
                        debug!(side = %self.side, kind = %self.kind, "namespace table grew, relisting");
                        remapped = true;
                        break;
                    }
                    next = stream.next() => match next {
                        Some(Ok(ev)) => {
                            backoff = INITIAL_BACKOFF;
                            self.handle(&ctx, ev).await;
                        }
                        Some(Err(e)) => {
                            warn!(side = %self.side, kind = %self.kind, error = %e, "watch error, reconnecting");
                            break;
                        }
                        None => {
                            debug!(side = %self.side, kind = %self.kind, "watch stream ended");
                            break;
                        }
                    }
                }
            }
            counter!("peerlink_watch_restarts_total", 1, "side" => self.side.as_str(), "kind" => self.kind.as_str());
            if remapped {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(max_backoff);
        }
        info!(side = %self.side, kind = %self.kind, "watch feed stopped");
        Ok(())
    }
}
