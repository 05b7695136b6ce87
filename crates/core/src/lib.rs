//! Peerlink core types: cluster sides, tracked object kinds and change deltas.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod labels;

pub use config::{ConfigError, EndpointsDirection, PeeringConfig};

/// Which of the two peered clusters an object was observed on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Home,
    Foreign,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Home => Side::Foreign,
            Side::Foreign => Side::Home,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Home => "home",
            Side::Foreign => "foreign",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource kinds the engine mirrors or consults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Pod,
    ReplicaSet,
    Service,
    Endpoints,
    EndpointSlice,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Pod,
        ResourceKind::ReplicaSet,
        ResourceKind::Service,
        ResourceKind::Endpoints,
        ResourceKind::EndpointSlice,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Pod => "Pod",
            ResourceKind::ReplicaSet => "ReplicaSet",
            ResourceKind::Service => "Service",
            ResourceKind::Endpoints => "Endpoints",
            ResourceKind::EndpointSlice => "EndpointSlice",
        }
    }

    /// `apiVersion` the kind is served under.
    pub fn api_version(self) -> &'static str {
        match self {
            ResourceKind::Pod | ResourceKind::Service | ResourceKind::Endpoints => "v1",
            ResourceKind::ReplicaSet => "apps/v1",
            ResourceKind::EndpointSlice => "discovery.k8s.io/v1",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown resource kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for ResourceKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pod" | "pods" => Ok(ResourceKind::Pod),
            "replicaset" | "replicasets" => Ok(ResourceKind::ReplicaSet),
            "service" | "services" | "svc" => Ok(ResourceKind::Service),
            "endpoints" | "ep" => Ok(ResourceKind::Endpoints),
            "endpointslice" | "endpointslices" => Ok(ResourceKind::EndpointSlice),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// Identity of a namespaced object on one side: `(kind, namespace, name)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// A Kubernetes object the engine tracks, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trackedKind", content = "object")]
pub enum TrackedObject {
    Pod(Pod),
    ReplicaSet(ReplicaSet),
    Service(Service),
    Endpoints(Endpoints),
    EndpointSlice(EndpointSlice),
}

impl TrackedObject {
    pub fn kind(&self) -> ResourceKind {
        match self {
            TrackedObject::Pod(_) => ResourceKind::Pod,
            TrackedObject::ReplicaSet(_) => ResourceKind::ReplicaSet,
            TrackedObject::Service(_) => ResourceKind::Service,
            TrackedObject::Endpoints(_) => ResourceKind::Endpoints,
            TrackedObject::EndpointSlice(_) => ResourceKind::EndpointSlice,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            TrackedObject::Pod(o) => &o.metadata,
            TrackedObject::ReplicaSet(o) => &o.metadata,
            TrackedObject::Service(o) => &o.metadata,
            TrackedObject::Endpoints(o) => &o.metadata,
            TrackedObject::EndpointSlice(o) => &o.metadata,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            TrackedObject::Pod(o) => &mut o.metadata,
            TrackedObject::ReplicaSet(o) => &mut o.metadata,
            TrackedObject::Service(o) => &mut o.metadata,
            TrackedObject::Endpoints(o) => &mut o.metadata,
            TrackedObject::EndpointSlice(o) => &mut o.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or("")
    }

    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or("")
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.kind(), self.namespace(), self.name())
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.meta().labels.as_ref().and_then(|l| l.get(key)).map(String::as_str)
    }

    pub fn finalizers(&self) -> &[String] {
        self.meta().finalizers.as_deref().unwrap_or(&[])
    }

    pub fn has_finalizer(&self, token: &str) -> bool {
        self.finalizers().iter().any(|f| f == token)
    }

    /// True once the API server accepted a delete and only finalizers keep the object around.
    pub fn is_terminating(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    pub fn as_pod(&self) -> Option<&Pod> {
        match self {
            TrackedObject::Pod(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_replica_set(&self) -> Option<&ReplicaSet> {
        match self {
            TrackedObject::ReplicaSet(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_service(&self) -> Option<&Service> {
        match self {
            TrackedObject::Service(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_endpoints(&self) -> Option<&Endpoints> {
        match self {
            TrackedObject::Endpoints(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_endpoint_slice(&self) -> Option<&EndpointSlice> {
        match self {
            TrackedObject::EndpointSlice(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Pod> for TrackedObject {
    fn from(v: Pod) -> Self {
        TrackedObject::Pod(v)
    }
}

impl From<ReplicaSet> for TrackedObject {
    fn from(v: ReplicaSet) -> Self {
        TrackedObject::ReplicaSet(v)
    }
}

impl From<Service> for TrackedObject {
    fn from(v: Service) -> Self {
        TrackedObject::Service(v)
    }
}

impl From<Endpoints> for TrackedObject {
    fn from(v: Endpoints) -> Self {
        TrackedObject::Endpoints(v)
    }
}

impl From<EndpointSlice> for TrackedObject {
    fn from(v: EndpointSlice) -> Self {
        TrackedObject::EndpointSlice(v)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// One observed change on one side, as fed to the cache and the reflectors.
#[derive(Debug, Clone)]
pub struct Delta {
    pub side: Side,
    pub kind: DeltaKind,
    pub object: Arc<TrackedObject>,
}

impl Delta {
    pub fn applied(side: Side, object: impl Into<Arc<TrackedObject>>) -> Self {
        Self { side, kind: DeltaKind::Applied, object: object.into() }
    }

    pub fn deleted(side: Side, object: impl Into<Arc<TrackedObject>>) -> Self {
        Self { side, kind: DeltaKind::Deleted, object: object.into() }
    }

    pub fn resource(&self) -> ResourceKind {
        self.object.kind()
    }
}
