//! In-memory [`ClusterApi`] with API-server-like semantics, for tests and demos.
//!
//! Models the parts the engine depends on: resourceVersion conflicts, AlreadyExists on
//! create, finalizer-gated deletion, and a list+watch stream per kind.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use peerlink_core::{ObjectKey, ResourceKind, TrackedObject};
use tokio::sync::broadcast;

use crate::{ClusterApi, ClusterError, WatchEvent, WatchFilter, WatchStream};

/// Number of calls per operation, for asserting write amplification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get: usize,
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub patch: usize,
}

impl CallCounts {
    pub fn writes(&self) -> usize {
        self.create + self.update + self.delete + self.patch
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, TrackedObject>,
    rv: u64,
    calls: CallCounts,
    conflicts_to_inject: usize,
}

impl State {
    fn next_rv(&mut self) -> String {
        self.rv += 1;
        self.rv.to_string()
    }

    fn injected_conflict(&mut self, key: &ObjectKey) -> Option<ClusterError> {
        if self.conflicts_to_inject > 0 {
            self.conflicts_to_inject -= 1;
            return Some(ClusterError::Conflict(format!("injected conflict on {}", key)));
        }
        None
    }
}

struct Inner {
    name: String,
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
}

#[derive(Clone)]
pub struct FakeCluster {
    inner: Arc<Inner>,
}

impl FakeCluster {
    pub fn new(name: impl Into<String>) -> Self {
        let (events, _rx) = broadcast::channel(1024);
        Self { inner: Arc::new(Inner { name: name.into(), state: Mutex::new(State::default()), events }) }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, ev: WatchEvent) {
        let _ = self.inner.events.send(ev);
    }

    /// Seed an object as if some other actor created it.
    pub fn insert(&self, obj: impl Into<TrackedObject>) -> TrackedObject {
        let mut obj = obj.into();
        let stored = {
            let mut st = self.state();
            stamp_new(&mut obj, st.next_rv());
            st.objects.insert(obj.key(), obj.clone());
            obj
        };
        self.emit(WatchEvent::Applied(stored.clone()));
        stored
    }

    pub fn object(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<TrackedObject> {
        self.state().objects.get(&ObjectKey::new(kind, namespace, name)).cloned()
    }

    pub fn objects(&self, kind: ResourceKind) -> Vec<TrackedObject> {
        self.state().objects.values().filter(|o| o.kind() == kind).cloned().collect()
    }

    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }

    /// Fail the next `n` writes with a resourceVersion conflict.
    pub fn inject_conflicts(&self, n: usize) {
        self.state().conflicts_to_inject = n;
    }

    fn snapshot(&self, kind: ResourceKind, filter: &WatchFilter) -> Vec<TrackedObject> {
        self.state().objects.values().filter(|o| o.kind() == kind && matches_filter(o, filter)).cloned().collect()
    }
}

fn stamp_new(obj: &mut TrackedObject, rv: String) {
    let meta = obj.meta_mut();
    meta.resource_version = Some(rv);
    if meta.uid.is_none() {
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
    }
    if meta.creation_timestamp.is_none() {
        meta.creation_timestamp = Some(Time(chrono::Utc::now()));
    }
    meta.deletion_timestamp = None;
}

/// Minimal selector support: `k=v` / `k` label terms and `spec.nodeName=x` for pods.
fn matches_filter(obj: &TrackedObject, filter: &WatchFilter) -> bool {
    let labels_ok = filter.labels.as_deref().map_or(true, |sel| {
        sel.split(',').map(str::trim).filter(|t| !t.is_empty()).all(|term| match term.split_once('=') {
            Some((k, v)) => obj.label(k) == Some(v),
            None => obj.label(term).is_some(),
        })
    });
    let fields_ok = filter.fields.as_deref().map_or(true, |sel| {
        sel.split(',').map(str::trim).filter(|t| !t.is_empty()).all(|term| match term.split_once('=') {
            Some(("spec.nodeName", v)) => obj
                .as_pod()
                .and_then(|p| p.spec.as_ref())
                .and_then(|s| s.node_name.as_deref())
                .map_or(false, |n| n == v),
            Some(("metadata.namespace", v)) => obj.namespace() == v,
            _ => true,
        })
    });
    labels_ok && fields_ok
}

fn filter_event(kind: ResourceKind, filter: &WatchFilter, ev: WatchEvent) -> Option<WatchEvent> {
    match ev {
        WatchEvent::Applied(o) if o.kind() == kind && matches_filter(&o, filter) => Some(WatchEvent::Applied(o)),
        WatchEvent::Deleted(o) if o.kind() == kind && matches_filter(&o, filter) => Some(WatchEvent::Deleted(o)),
        _ => None,
    }
}

fn check_rv(stored: &TrackedObject, requested: Option<&str>) -> Result<(), ClusterError> {
    match requested {
        Some(rv) if Some(rv) != stored.resource_version() => Err(ClusterError::Conflict(format!(
            "{}: resourceVersion {} is stale (current {})",
            stored.key(),
            rv,
            stored.resource_version().unwrap_or("-")
        ))),
        _ => Ok(()),
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<TrackedObject>, ClusterError> {
        let mut st = self.state();
        st.calls.get += 1;
        Ok(st.objects.get(&ObjectKey::new(kind, namespace, name)).cloned())
    }

    async fn create(&self, obj: &TrackedObject) -> Result<TrackedObject, ClusterError> {
        let key = obj.key();
        let created = {
            let mut st = self.state();
            st.calls.create += 1;
            if let Some(err) = st.injected_conflict(&key) {
                return Err(err);
            }
            if st.objects.contains_key(&key) {
                return Err(ClusterError::AlreadyExists(key.to_string()));
            }
            let mut obj = obj.clone();
            obj.meta_mut().uid = None;
            stamp_new(&mut obj, st.next_rv());
            st.objects.insert(key, obj.clone());
            obj
        };
        self.emit(WatchEvent::Applied(created.clone()));
        Ok(created)
    }

    async fn update(&self, obj: &TrackedObject) -> Result<TrackedObject, ClusterError> {
        let key = obj.key();
        let updated = {
            let mut st = self.state();
            st.calls.update += 1;
            if let Some(err) = st.injected_conflict(&key) {
                return Err(err);
            }
            let stored = st.objects.get(&key).cloned().ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
            check_rv(&stored, obj.resource_version())?;
            let mut next = obj.clone();
            let rv = st.next_rv();
            {
                let (old, meta) = (stored.meta(), next.meta_mut());
                meta.uid = old.uid.clone();
                meta.creation_timestamp = old.creation_timestamp.clone();
                meta.deletion_timestamp = old.deletion_timestamp.clone();
                meta.finalizers = old.finalizers.clone();
                meta.resource_version = Some(rv);
            }
            st.objects.insert(key, next.clone());
            next
        };
        self.emit(WatchEvent::Applied(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let key = ObjectKey::new(kind, namespace, name);
        let ev = {
            let mut st = self.state();
            st.calls.delete += 1;
            if let Some(err) = st.injected_conflict(&key) {
                return Err(err);
            }
            let stored = st.objects.get(&key).cloned().ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
            if stored.finalizers().is_empty() {
                st.objects.remove(&key);
                WatchEvent::Deleted(stored)
            } else if stored.is_terminating() {
                return Ok(());
            } else {
                let mut next = stored;
                let rv = st.next_rv();
                next.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
                next.meta_mut().resource_version = Some(rv);
                st.objects.insert(key, next.clone());
                WatchEvent::Applied(next)
            }
        };
        self.emit(ev);
        Ok(())
    }

    async fn set_finalizers(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        finalizers: &[String],
        resource_version: Option<&str>,
    ) -> Result<TrackedObject, ClusterError> {
        let key = ObjectKey::new(kind, namespace, name);
        let (out, ev) = {
            let mut st = self.state();
            st.calls.patch += 1;
            if let Some(err) = st.injected_conflict(&key) {
                return Err(err);
            }
            let stored = st.objects.get(&key).cloned().ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
            check_rv(&stored, resource_version)?;
            let mut next = stored;
            next.meta_mut().finalizers = if finalizers.is_empty() { None } else { Some(finalizers.to_vec()) };
            let rv = st.next_rv();
            next.meta_mut().resource_version = Some(rv);
            if next.is_terminating() && finalizers.is_empty() {
                st.objects.remove(&key);
                (next.clone(), WatchEvent::Deleted(next))
            } else {
                st.objects.insert(key, next.clone());
                (next.clone(), WatchEvent::Applied(next))
            }
        };
        self.emit(ev);
        Ok(out)
    }

    fn watch(&self, kind: ResourceKind, filter: &WatchFilter) -> WatchStream {
        // Subscribe before the snapshot so nothing falls in between; duplicates are harmless.
        let rx = self.inner.events.subscribe();
        let initial = self.snapshot(kind, filter);
        let filter = filter.clone();
        let head = stream::once(async move { Ok(WatchEvent::Restarted(initial)) });
        let tail = stream::unfold((rx, filter), move |(mut rx, filter)| async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => {
                        if let Some(ev) = filter_event(kind, &filter, ev) {
                            return Some((Ok(ev), (rx, filter)));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        return Some((Err(ClusterError::Watch(format!("lagged by {} events", n))), (rx, filter)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        head.chain(tail).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::ReplicaSet;
    use k8s_openapi::api::core::v1::Pod;

    fn pod(ns: &str, name: &str) -> Pod {
        let mut p = Pod::default();
        p.metadata.namespace = Some(ns.into());
        p.metadata.name = Some(name.into());
        p
    }

    #[tokio::test]
    async fn create_twice_reports_already_exists() {
        let c = FakeCluster::new("t");
        let obj = TrackedObject::from(pod("web", "a"));
        c.create(&obj).await.unwrap();
        let err = c.create(&obj).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(c.objects(ResourceKind::Pod).len(), 1);
    }

    #[tokio::test]
    async fn finalized_delete_waits_for_finalizer_removal() {
        let c = FakeCluster::new("t");
        let mut rs = ReplicaSet::default();
        rs.metadata.namespace = Some("web".into());
        rs.metadata.name = Some("a".into());
        rs.metadata.finalizers = Some(vec!["hold".into()]);
        c.insert(rs);

        c.delete(ResourceKind::ReplicaSet, "web", "a").await.unwrap();
        let terminating = c.object(ResourceKind::ReplicaSet, "web", "a").unwrap();
        assert!(terminating.is_terminating());

        c.set_finalizers(ResourceKind::ReplicaSet, "web", "a", &[], terminating.resource_version()).await.unwrap();
        assert!(c.object(ResourceKind::ReplicaSet, "web", "a").is_none());
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let c = FakeCluster::new("t");
        let stored = c.insert(pod("web", "a"));
        c.set_finalizers(ResourceKind::Pod, "web", "a", &["x".into()], stored.resource_version()).await.unwrap();
        let err = c.set_finalizers(ResourceKind::Pod, "web", "a", &[], stored.resource_version()).await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
    }

    #[tokio::test]
    async fn watch_starts_with_relist_then_streams_changes() {
        let c = FakeCluster::new("t");
        c.insert(pod("web", "a"));
        let mut w = c.watch(ResourceKind::Pod, &WatchFilter::default());
        match w.next().await {
            Some(Ok(WatchEvent::Restarted(list))) => assert_eq!(list.len(), 1),
            other => panic!("unexpected first event: {:?}", other),
        }
        c.delete(ResourceKind::Pod, "web", "a").await.unwrap();
        match w.next().await {
            Some(Ok(WatchEvent::Deleted(o))) => assert_eq!(o.name(), "a"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn label_and_node_filters() {
        let mut p = pod("web", "a");
        p.metadata.labels = Some([("app".to_string(), "x".to_string())].into_iter().collect());
        p.spec = Some(k8s_openapi::api::core::v1::PodSpec { node_name: Some("vk-1".into()), ..Default::default() });
        let obj = TrackedObject::from(p);
        assert!(matches_filter(&obj, &WatchFilter::labels("app=x")));
        assert!(matches_filter(&obj, &WatchFilter::labels("app")));
        assert!(!matches_filter(&obj, &WatchFilter::labels("app=y")));
        assert!(matches_filter(&obj, &WatchFilter::fields("spec.nodeName=vk-1")));
        assert!(!matches_filter(&obj, &WatchFilter::fields("spec.nodeName=vk-2")));
    }
}
