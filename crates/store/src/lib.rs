//! Peerlink store: the dual-sided object cache fed by both clusters' watch streams.
//!
//! Objects are bucketed per `(side, kind, namespace)`. Each bucket is an immutable map behind
//! an `ArcSwap`, so readers take lock-free snapshots while writers publish a new map per change.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use metrics::counter;
use peerlink_core::{Delta, DeltaKind, ObjectKey, ResourceKind, Side, TrackedObject};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Typed miss returned by lookups; a normal outcome, not a failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{side} {key} not cached")]
pub struct CacheMiss {
    pub side: Side,
    pub key: ObjectKey,
}

#[derive(Debug)]
pub struct CacheEntry {
    pub object: Arc<TrackedObject>,
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    side: Side,
    kind: ResourceKind,
    namespace: String,
}

type Names = FxHashMap<String, Arc<CacheEntry>>;
type Bucket = ArcSwap<Names>;

#[derive(Clone)]
struct Subscriber {
    kind: ResourceKind,
    tx: mpsc::UnboundedSender<Delta>,
}

#[derive(Default)]
pub struct DualCache {
    buckets: ArcSwap<FxHashMap<BucketKey, Arc<Bucket>>>,
    subscribers: ArcSwap<Vec<Subscriber>>,
}

impl DualCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_by_side(&self, side: Side, kind: ResourceKind, namespace: &str, name: &str) -> Result<Arc<TrackedObject>, CacheMiss> {
        self.entry(side, kind, namespace, name)
            .map(|e| Arc::clone(&e.object))
            .ok_or_else(|| CacheMiss { side, key: ObjectKey::new(kind, namespace, name) })
    }

    pub fn entry(&self, side: Side, kind: ResourceKind, namespace: &str, name: &str) -> Option<Arc<CacheEntry>> {
        let bucket = self.bucket(&BucketKey { side, kind, namespace: namespace.to_string() })?;
        let names = bucket.load();
        names.get(name).cloned()
    }

    /// Snapshot of one namespace; later writes do not affect the returned vector.
    pub fn list_by_side(&self, side: Side, kind: ResourceKind, namespace: &str) -> Vec<Arc<TrackedObject>> {
        let Some(bucket) = self.bucket(&BucketKey { side, kind, namespace: namespace.to_string() }) else {
            return Vec::new();
        };
        let names = bucket.load_full();
        let mut out: Vec<_> = names.values().map(|e| Arc::clone(&e.object)).collect();
        out.sort_by(|a, b| a.name().cmp(b.name()));
        out
    }

    /// Snapshot across every namespace of `(side, kind)`.
    pub fn list_all(&self, side: Side, kind: ResourceKind) -> Vec<Arc<TrackedObject>> {
        let buckets = self.buckets.load_full();
        let mut out: Vec<Arc<TrackedObject>> = buckets
            .iter()
            .filter(|(k, _)| k.side == side && k.kind == kind)
            .flat_map(|(_, b)| b.load_full().values().map(|e| Arc::clone(&e.object)).collect::<Vec<_>>())
            .collect();
        out.sort_by(|a, b| a.namespace().cmp(b.namespace()).then_with(|| a.name().cmp(b.name())));
        out
    }

    /// Objects in one namespace whose label `key` equals `value`.
    pub fn find_by_label(&self, side: Side, kind: ResourceKind, namespace: &str, key: &str, value: &str) -> Vec<Arc<TrackedObject>> {
        self.list_by_side(side, kind, namespace).into_iter().filter(|o| o.label(key) == Some(value)).collect()
    }

    pub fn len(&self, side: Side, kind: ResourceKind) -> usize {
        let buckets = self.buckets.load();
        buckets.iter().filter(|(k, _)| k.side == side && k.kind == kind).map(|(_, b)| b.load().len()).sum()
    }

    pub fn is_empty(&self, side: Side, kind: ResourceKind) -> bool {
        self.len(side, kind) == 0
    }

    /// Record an observed object. Returns the delta published to callbacks, or `None` when the
    /// same resourceVersion was already cached (a redelivered event).
    pub fn apply(&self, side: Side, object: TrackedObject) -> Option<Delta> {
        let delta = self.store(side, object)?;
        self.notify(&delta);
        Some(delta)
    }

    /// Record an observed deletion. `None` when the object was not cached.
    pub fn remove(&self, side: Side, object: &TrackedObject) -> Option<Delta> {
        self.evict(side, object.kind(), object.namespace(), object.name())?;
        let delta = Delta::deleted(side, object.clone());
        self.notify(&delta);
        Some(delta)
    }

    /// Replace everything cached for `(side, kind)` with a fresh relist, publishing an applied
    /// delta per new/changed object and a deleted delta per vanished one.
    pub fn replace(&self, side: Side, kind: ResourceKind, objects: Vec<TrackedObject>) -> Vec<Delta> {
        let mut keep: FxHashMap<(String, String), ()> = FxHashMap::default();
        let mut out = Vec::new();
        for obj in objects {
            if obj.kind() != kind {
                continue;
            }
            keep.insert((obj.namespace().to_string(), obj.name().to_string()), ());
            if let Some(d) = self.store(side, obj) {
                out.push(d);
            }
        }
        for stale in self.list_all(side, kind) {
            if !keep.contains_key(&(stale.namespace().to_string(), stale.name().to_string())) {
                self.evict(side, kind, stale.namespace(), stale.name());
                out.push(Delta::deleted(side, stale));
            }
        }
        debug!(side = %side, kind = %kind, changed = out.len(), "cache relisted");
        for d in &out {
            self.notify(d);
        }
        out
    }

    /// Drop an entry known to be stale without publishing a change.
    pub fn invalidate(&self, side: Side, kind: ResourceKind, namespace: &str, name: &str) -> bool {
        let hit = self.evict(side, kind, namespace, name).is_some();
        if hit {
            debug!(side = %side, kind = %kind, ns = %namespace, name = %name, "cache entry invalidated");
        }
        hit
    }

    /// Overwrite an entry with a freshly fetched object (or drop it), without publishing a change.
    pub fn reseed(&self, side: Side, kind: ResourceKind, namespace: &str, name: &str, fresh: Option<TrackedObject>) {
        match fresh {
            Some(obj) if obj.kind() == kind && obj.namespace() == namespace && obj.name() == name => {
                let _ = self.store(side, obj);
            }
            _ => {
                self.evict(side, kind, namespace, name);
            }
        }
    }

    /// Register `callback` for every change of `kind` on either side. Callbacks run on a
    /// dedicated task in delivery order and never block cache writers.
    pub fn on_change<F>(&self, kind: ResourceKind, callback: F) -> JoinHandle<()>
    where
        F: Fn(&Delta) + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delta>();
        let sub = Subscriber { kind, tx };
        self.subscribers.rcu(|cur| {
            let mut next = Vec::clone(cur);
            next.push(sub.clone());
            next
        });
        tokio::spawn(async move {
            while let Some(d) = rx.recv().await {
                callback(&d);
            }
            debug!(kind = %kind, "cache callback dispatcher stopped");
        })
    }

    fn bucket(&self, key: &BucketKey) -> Option<Arc<Bucket>> {
        self.buckets.load().get(key).cloned()
    }

    fn bucket_or_create(&self, key: BucketKey) -> Arc<Bucket> {
        if let Some(b) = self.bucket(&key) {
            return b;
        }
        let fresh: Arc<Bucket> = Arc::new(ArcSwap::from_pointee(Names::default()));
        self.buckets.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            next.entry(key.clone()).or_insert_with(|| Arc::clone(&fresh));
            next
        });
        // Buckets are never removed, so the key is present now.
        self.bucket(&key).unwrap_or(fresh)
    }

    fn store(&self, side: Side, object: TrackedObject) -> Option<Delta> {
        let kind = object.kind();
        let name = object.name().to_string();
        let bucket = self.bucket_or_create(BucketKey { side, kind, namespace: object.namespace().to_string() });
        let rv = object.resource_version().map(str::to_string);
        if let (Some(cur), Some(new_rv)) = (bucket.load().get(&name), rv.as_deref()) {
            if cur.resource_version.as_deref() == Some(new_rv) {
                trace!(side = %side, kind = %kind, name = %name, rv = new_rv, "duplicate event ignored");
                return None;
            }
        }
        let object = Arc::new(object);
        let entry = Arc::new(CacheEntry { object: Arc::clone(&object), resource_version: rv });
        bucket.rcu(|cur| {
            let mut next = Names::clone(cur);
            next.insert(name.clone(), Arc::clone(&entry));
            next
        });
        Some(Delta { side, kind: DeltaKind::Applied, object })
    }

    fn evict(&self, side: Side, kind: ResourceKind, namespace: &str, name: &str) -> Option<Arc<CacheEntry>> {
        let bucket = self.bucket(&BucketKey { side, kind, namespace: namespace.to_string() })?;
        let mut removed = None;
        bucket.rcu(|cur| {
            let mut next = Names::clone(cur);
            removed = next.remove(name);
            next
        });
        removed
    }

    fn notify(&self, delta: &Delta) {
        counter!("peerlink_cache_events_total", 1, "side" => delta.side.as_str(), "kind" => delta.resource().as_str());
        let subs = self.subscribers.load();
        for s in subs.iter().filter(|s| s.kind == delta.resource()) {
            // A closed receiver only means the callback task is gone.
            let _ = s.tx.send(delta.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;

    fn pod(ns: &str, name: &str, rv: &str) -> TrackedObject {
        let mut p = Pod::default();
        p.metadata.namespace = Some(ns.into());
        p.metadata.name = Some(name.into());
        p.metadata.resource_version = Some(rv.into());
        TrackedObject::Pod(p)
    }

    #[test]
    fn miss_is_typed() {
        let c = DualCache::new();
        let miss = c.get_by_side(Side::Home, ResourceKind::Pod, "web", "a").unwrap_err();
        assert_eq!(miss.key, ObjectKey::new(ResourceKind::Pod, "web", "a"));
    }

    #[test]
    fn sides_are_independent() {
        let c = DualCache::new();
        c.apply(Side::Home, pod("web", "a", "1"));
        assert!(c.get_by_side(Side::Home, ResourceKind::Pod, "web", "a").is_ok());
        assert!(c.get_by_side(Side::Foreign, ResourceKind::Pod, "web", "a").is_err());
        assert!(c.get_by_side(Side::Home, ResourceKind::ReplicaSet, "web", "a").is_err());
    }

    #[test]
    fn redelivered_version_is_not_republished() {
        let c = DualCache::new();
        assert!(c.apply(Side::Home, pod("web", "a", "1")).is_some());
        assert!(c.apply(Side::Home, pod("web", "a", "1")).is_none());
        assert!(c.apply(Side::Home, pod("web", "a", "2")).is_some());
        assert_eq!(c.entry(Side::Home, ResourceKind::Pod, "web", "a").unwrap().resource_version.as_deref(), Some("2"));
    }

    #[test]
    fn list_snapshot_is_stable_under_writes() {
        let c = DualCache::new();
        c.apply(Side::Foreign, pod("ns", "a", "1"));
        c.apply(Side::Foreign, pod("ns", "b", "1"));
        let snap = c.list_by_side(Side::Foreign, ResourceKind::Pod, "ns");
        c.remove(Side::Foreign, &pod("ns", "a", "1"));
        c.apply(Side::Foreign, pod("ns", "c", "1"));
        let names: Vec<_> = snap.iter().map(|o| o.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(c.list_by_side(Side::Foreign, ResourceKind::Pod, "ns").len(), 2);
    }

    #[test]
    fn invalidate_and_reseed_are_silent() {
        let c = DualCache::new();
        c.apply(Side::Home, pod("web", "a", "1"));
        assert!(c.invalidate(Side::Home, ResourceKind::Pod, "web", "a"));
        assert!(!c.invalidate(Side::Home, ResourceKind::Pod, "web", "a"));
        c.reseed(Side::Home, ResourceKind::Pod, "web", "a", Some(pod("web", "a", "7")));
        assert_eq!(c.entry(Side::Home, ResourceKind::Pod, "web", "a").unwrap().resource_version.as_deref(), Some("7"));
        c.reseed(Side::Home, ResourceKind::Pod, "web", "a", None);
        assert!(c.is_empty(Side::Home, ResourceKind::Pod));
    }
}
