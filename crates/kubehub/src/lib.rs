//! Peerlink kubehub – typed access to one cluster's API server.
//!
//! Everything the engine does to a cluster goes through [`ClusterApi`], so reflectors
//! hold explicit handles to the home and foreign clusters instead of shared globals.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::NamespaceResourceScope,
    runtime::{watcher, WatchStreamExt},
    Client, Resource,
};
use peerlink_core::{ResourceKind, TrackedObject};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

pub mod fake;

pub use fake::{CallCounts, FakeCluster};

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("watch: {0}")]
    Watch(String),
    #[error("kube api: {0}")]
    Api(kube::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists(_))
    }

    /// Errors the next watch-driven pass may well not hit again.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Conflict(_) | ClusterError::Watch(_) | ClusterError::Api(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(ae.message),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => ClusterError::AlreadyExists(ae.message),
            kube::Error::Api(ae) if ae.code == 409 => ClusterError::Conflict(ae.message),
            other => ClusterError::Api(other),
        }
    }
}

/// One watch notification, already converted to the tagged object form.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(TrackedObject),
    Deleted(TrackedObject),
    /// Full relist after (re)connecting; anything not in the list is gone.
    Restarted(Vec<TrackedObject>),
}

/// Server-side selectors narrowing a watch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchFilter {
    pub labels: Option<String>,
    pub fields: Option<String>,
}

impl WatchFilter {
    pub fn labels(sel: impl Into<String>) -> Self {
        Self { labels: Some(sel.into()), fields: None }
    }

    pub fn fields(sel: impl Into<String>) -> Self {
        Self { labels: None, fields: Some(sel.into()) }
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, ClusterError>>;

/// CRUD + watch surface of one cluster, limited to the kinds the engine tracks.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Human readable cluster label for logs.
    fn name(&self) -> &str;

    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<TrackedObject>, ClusterError>;

    async fn create(&self, obj: &TrackedObject) -> Result<TrackedObject, ClusterError>;

    /// Full replace; the object's resourceVersion guards against lost updates.
    async fn update(&self, obj: &TrackedObject) -> Result<TrackedObject, ClusterError>;

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// JSON merge patch of `metadata.finalizers`, guarded by `resource_version` when given.
    async fn set_finalizers(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        finalizers: &[String],
        resource_version: Option<&str>,
    ) -> Result<TrackedObject, ClusterError>;

    /// Cluster-wide list+watch of `kind`; starts with a `Restarted` relist.
    fn watch(&self, kind: ResourceKind, filter: &WatchFilter) -> WatchStream;
}

/// Merge patch body replacing the finalizer list.
pub fn finalizer_patch(finalizers: &[String], resource_version: Option<&str>) -> serde_json::Value {
    let mut meta = serde_json::json!({ "finalizers": finalizers });
    if let Some(rv) = resource_version {
        meta["resourceVersion"] = serde_json::Value::String(rv.to_string());
    }
    serde_json::json!({ "metadata": meta })
}

/// Append `token` to the object's finalizers; `None` when it was already present.
pub async fn add_finalizer(api: &dyn ClusterApi, obj: &TrackedObject, token: &str) -> Result<Option<TrackedObject>, ClusterError> {
    if obj.has_finalizer(token) {
        return Ok(None);
    }
    let mut list = obj.finalizers().to_vec();
    list.push(token.to_string());
    let out = api.set_finalizers(obj.kind(), obj.namespace(), obj.name(), &list, obj.resource_version()).await?;
    debug!(cluster = %api.name(), key = %obj.key(), token, "finalizer added");
    Ok(Some(out))
}

/// Remove `token` from the object's finalizers; `None` when it was not present.
pub async fn remove_finalizer(api: &dyn ClusterApi, obj: &TrackedObject, token: &str) -> Result<Option<TrackedObject>, ClusterError> {
    if !obj.has_finalizer(token) {
        return Ok(None);
    }
    let list: Vec<String> = obj.finalizers().iter().filter(|f| f.as_str() != token).cloned().collect();
    let out = api.set_finalizers(obj.kind(), obj.namespace(), obj.name(), &list, obj.resource_version()).await?;
    debug!(cluster = %api.name(), key = %obj.key(), token, "finalizer removed");
    Ok(Some(out))
}

/// [`ClusterApi`] backed by a kube-rs client.
#[derive(Clone)]
pub struct KubeCluster {
    name: String,
    client: Client,
}

macro_rules! with_api {
    ($self:ident, $kind:expr, $ns:expr, |$api:ident| $body:expr) => {
        match $kind {
            ResourceKind::Pod => { let $api: Api<Pod> = $self.api($ns); $body }
            ResourceKind::ReplicaSet => { let $api: Api<ReplicaSet> = $self.api($ns); $body }
            ResourceKind::Service => { let $api: Api<Service> = $self.api($ns); $body }
            ResourceKind::Endpoints => { let $api: Api<Endpoints> = $self.api($ns); $body }
            ResourceKind::EndpointSlice => { let $api: Api<EndpointSlice> = $self.api($ns); $body }
        }
    };
}

macro_rules! on_tracked {
    ($obj:expr, |$o:ident| $body:expr) => {
        match $obj {
            TrackedObject::Pod($o) => $body,
            TrackedObject::ReplicaSet($o) => $body,
            TrackedObject::Service($o) => $body,
            TrackedObject::Endpoints($o) => $body,
            TrackedObject::EndpointSlice($o) => $body,
        }
    };
}

impl KubeCluster {
    pub fn new(name: impl Into<String>, client: Client) -> Self {
        Self { name: name.into(), client }
    }

    /// Client from the ambient kubeconfig / in-cluster environment.
    pub async fn try_default(name: impl Into<String>) -> Result<Self> {
        let client = Client::try_default().await.context("building default kube client")?;
        Ok(Self::new(name, client))
    }

    /// Client from an explicit kubeconfig file (the peer's credentials).
    pub async fn from_kubeconfig(name: impl Into<String>, path: &std::path::Path) -> Result<Self> {
        let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
        let cfg = kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("loading kubeconfig {}", path.display()))?;
        let client = Client::try_from(cfg).context("building kube client")?;
        let name = name.into();
        info!(cluster = %name, path = %path.display(), "cluster client ready");
        Ok(Self::new(name, client))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn api_of<K>(&self, _obj: &K, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        self.api(namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<TrackedObject>, ClusterError> {
        Ok(with_api!(self, kind, namespace, |api| api.get_opt(name).await?.map(TrackedObject::from)))
    }

    async fn create(&self, obj: &TrackedObject) -> Result<TrackedObject, ClusterError> {
        let pp = PostParams::default();
        let ns = obj.namespace();
        Ok(on_tracked!(obj, |o| self.api_of(o, ns).create(&pp, o).await?.into()))
    }

    async fn update(&self, obj: &TrackedObject) -> Result<TrackedObject, ClusterError> {
        let pp = PostParams::default();
        let (ns, name) = (obj.namespace(), obj.name());
        Ok(on_tracked!(obj, |o| self.api_of(o, ns).replace(name, &pp, o).await?.into()))
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let dp = DeleteParams::background();
        with_api!(self, kind, namespace, |api| {
            api.delete(name, &dp).await?;
        });
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
        let patch = finalizer_patch(finalizers, resource_version);
        let pp = PatchParams::default();
        Ok(with_api!(self, kind, namespace, |api| api.patch(name, &pp, &Patch::Merge(&patch)).await?.into()))
    }

    fn watch(&self, kind: ResourceKind, filter: &WatchFilter) -> WatchStream {
        let mut cfg = watcher::Config::default();
        if let Some(l) = filter.labels.as_deref() {
            cfg = cfg.labels(l);
        }
        if let Some(f) = filter.fields.as_deref() {
            cfg = cfg.fields(f);
        }
        let client = self.client.clone();
        match kind {
            ResourceKind::Pod => typed_watch(Api::<Pod>::all(client), cfg),
            ResourceKind::ReplicaSet => typed_watch(Api::<ReplicaSet>::all(client), cfg),
            ResourceKind::Service => typed_watch(Api::<Service>::all(client), cfg),
            ResourceKind::Endpoints => typed_watch(Api::<Endpoints>::all(client), cfg),
            ResourceKind::EndpointSlice => typed_watch(Api::<EndpointSlice>::all(client), cfg),
        }
    }
}

fn typed_watch<K>(api: Api<K>, cfg: watcher::Config) -> WatchStream
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
    K: Into<TrackedObject>,
{
    watcher::watcher(api, cfg)
        .default_backoff()
        .map(|res| match res {
            Ok(watcher::Event::Applied(o)) => Ok(WatchEvent::Applied(o.into())),
            Ok(watcher::Event::Deleted(o)) => Ok(WatchEvent::Deleted(o.into())),
            Ok(watcher::Event::Restarted(list)) => Ok(WatchEvent::Restarted(list.into_iter().map(Into::into).collect())),
            Err(e) => Err(ClusterError::Watch(e.to_string())),
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalizer_patch_carries_resource_version() {
        let p = finalizer_patch(&["a/b".to_string()], Some("42"));
        assert_eq!(p, serde_json::json!({ "metadata": { "finalizers": ["a/b"], "resourceVersion": "42" } }));
        let p = finalizer_patch(&[], None);
        assert_eq!(p, serde_json::json!({ "metadata": { "finalizers": [] } }));
    }

    #[test]
    fn kube_errors_map_to_taxonomy() {
        let api_err = |code: u16, reason: &str| {
            kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".into(),
                message: "boom".into(),
                reason: reason.into(),
                code,
            })
        };
        assert!(ClusterError::from(api_err(404, "NotFound")).is_not_found());
        assert!(ClusterError::from(api_err(409, "AlreadyExists")).is_already_exists());
        let conflict = ClusterError::from(api_err(409, "Conflict"));
        assert!(matches!(conflict, ClusterError::Conflict(_)));
        assert!(conflict.is_transient());
        assert!(ClusterError::from(api_err(500, "InternalError")).is_transient());
    }
}
