//! Peerlink forge: translation of objects crossing the home ↔ foreign boundary.
//!
//! Every function here builds a fresh destination object; inputs (usually cache snapshots)
//! are never mutated. The only state consulted is the namespace table and, for service
//! environment rewriting, read-only cache lookups.

#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use peerlink_core::{PeeringConfig, Side};
use peerlink_nat::{NamespaceMapper, NatError};
use peerlink_store::DualCache;

pub mod endpoints;
pub mod env;
pub mod pods;
pub mod services;

pub use endpoints::{endpoint_slice, endpoints_equivalent, qualifying_address, translate_endpoints};
pub use pods::{home_pod_from_foreign, is_daemonset_owned, replicaset_from_pod};
pub use services::translate_service;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    /// The source object lacks something structurally required; retrying cannot help.
    #[error("malformed source object: missing {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    Nat(#[from] NatError),
}

/// Translator bound to one peering.
#[derive(Clone)]
pub struct Translator {
    cfg: Arc<PeeringConfig>,
    nat: Arc<NamespaceMapper>,
    cache: Arc<DualCache>,
}

impl Translator {
    pub fn new(cfg: Arc<PeeringConfig>, nat: Arc<NamespaceMapper>, cache: Arc<DualCache>) -> Self {
        Self { cfg, nat, cache }
    }

    pub fn config(&self) -> &PeeringConfig {
        &self.cfg
    }

    pub fn nat(&self) -> &NamespaceMapper {
        &self.nat
    }

    /// Foreign ReplicaSet wrapping `home`, or `None` for DaemonSet-owned pods.
    /// Allocates the namespace mapping on first use.
    pub fn replicaset_for(&self, home: &Pod) -> Result<Option<ReplicaSet>, TranslateError> {
        if is_daemonset_owned(home) {
            return Ok(None);
        }
        let home_ns = home.metadata.namespace.as_deref().ok_or(TranslateError::MissingField("metadata.namespace"))?;
        let foreign_ns = self.nat.nat_namespace(home_ns, true)?;
        let mut rs = replicaset_from_pod(home, &foreign_ns, &self.cfg.virtual_node_name)?;
        if let Some(spec) = rs.spec.as_mut().and_then(|s| s.template.as_mut()).and_then(|t| t.spec.as_mut()) {
            env::rewrite_pod_spec(spec, home_ns, &foreign_ns, &self.cache);
        }
        Ok(Some(rs))
    }

    /// Home-shaped view of a foreign pod; `home` is the cached home pod when there is one.
    pub fn home_pod_for(&self, foreign: &Pod, home: Option<&Pod>) -> Result<Pod, TranslateError> {
        let foreign_ns = foreign.metadata.namespace.as_deref().ok_or(TranslateError::MissingField("metadata.namespace"))?;
        let home_ns = self.nat.de_nat_namespace(foreign_ns)?;
        home_pod_from_foreign(foreign, home, &home_ns, &self.cfg.virtual_node_name)
    }

    pub fn service_for(&self, home: &Service, existing: Option<&Service>) -> Result<Option<Service>, TranslateError> {
        let home_ns = home.metadata.namespace.as_deref().ok_or(TranslateError::MissingField("metadata.namespace"))?;
        let foreign_ns = self.nat.nat_namespace(home_ns, true)?;
        Ok(translate_service(home, existing, &foreign_ns, &self.cfg.home_cluster_id))
    }

    /// Destination Endpoints for `source` observed on `origin`.
    pub fn endpoints_for(&self, source: &Endpoints, origin: Side, destination_ns: &str) -> Option<Endpoints> {
        translate_endpoints(source, destination_ns, &self.cfg.virtual_node_prefix, self.cfg.cluster_id(origin))
    }

    pub fn endpoint_slice_for(&self, service: &Service, source: &Endpoints) -> Result<Option<EndpointSlice>, TranslateError> {
        endpoint_slice(service, source, &self.cfg.virtual_node_prefix)
    }
}
