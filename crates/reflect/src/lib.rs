//! Peerlink reflect: watch-driven reconciliation between a home and a foreign cluster.
//!
//! One feeder task per `(side, kind)` turns watch events into cache updates and [`Delta`]s;
//! one worker per reflector consumes its deltas strictly in order. The [`Supervisor`] owns
//! all of them and cancels them as a unit.

#![forbid(unsafe_code)]

use std::sync::Arc;

use peerlink_core::{Delta, PeeringConfig, ResourceKind, Side};
use peerlink_forge::{TranslateError, Translator};
use peerlink_kubehub::{ClusterApi, ClusterError};
use peerlink_nat::{NamespaceMapper, NatError};
use peerlink_store::DualCache;

pub mod endpoints;
pub mod feeder;
pub mod pods;
pub mod services;
pub mod supervisor;

pub use endpoints::EndpointsReflector;
pub use pods::PodReflector;
pub use services::ServiceReflector;
pub use supervisor::Supervisor;

/// What one reconciliation pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Created,
    Updated,
    Deleted,
    /// Home finalizer removed after the foreign counterpart was confirmed gone.
    Finalized,
    Unchanged,
    /// Not this reflector's business (DaemonSet pods, reflected objects, unmapped namespaces).
    Skipped,
    /// A referenced object is not there yet; retried on the next relevant event.
    Deferred,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Deleted => "deleted",
            Outcome::Finalized => "finalized",
            Outcome::Unchanged => "unchanged",
            Outcome::Skipped => "skipped",
            Outcome::Deferred => "deferred",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    NotFound,
    AlreadyExists,
    Malformed,
    Transient,
    Configuration,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::NotFound => "not_found",
            ErrorClass::AlreadyExists => "already_exists",
            ErrorClass::Malformed => "malformed",
            ErrorClass::Transient => "transient",
            ErrorClass::Configuration => "configuration",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReflectError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Translate(#[from] TranslateError),
    #[error(transparent)]
    Nat(#[from] NatError),
}

impl ReflectError {
    pub fn class(&self) -> ErrorClass {
        fn nat_class(e: &NatError) -> ErrorClass {
            if e.is_configuration_defect() {
                ErrorClass::Configuration
            } else {
                ErrorClass::NotFound
            }
        }
        match self {
            ReflectError::Cluster(ClusterError::NotFound(_)) => ErrorClass::NotFound,
            ReflectError::Cluster(ClusterError::AlreadyExists(_)) => ErrorClass::AlreadyExists,
            ReflectError::Cluster(ClusterError::Serde(_)) => ErrorClass::Malformed,
            ReflectError::Cluster(ClusterError::Unsupported(_)) => ErrorClass::Configuration,
            ReflectError::Cluster(_) => ErrorClass::Transient,
            ReflectError::Translate(TranslateError::MissingField(_)) => ErrorClass::Malformed,
            ReflectError::Translate(TranslateError::Nat(e)) | ReflectError::Nat(e) => nat_class(e),
        }
    }
}

/// Everything a reflector needs for one peering, injected explicitly.
#[derive(Clone)]
pub struct PeeringContext {
    pub cfg: Arc<PeeringConfig>,
    pub home: Arc<dyn ClusterApi>,
    pub foreign: Arc<dyn ClusterApi>,
    pub cache: Arc<DualCache>,
    pub nat: Arc<NamespaceMapper>,
    pub forge: Translator,
}

impl PeeringContext {
    pub fn new(cfg: PeeringConfig, home: Arc<dyn ClusterApi>, foreign: Arc<dyn ClusterApi>) -> Result<Self, NatError> {
        let nat = Arc::new(NamespaceMapper::with_static(cfg.home_cluster_id.clone(), cfg.static_namespaces.clone())?);
        Ok(Self::with_parts(Arc::new(cfg), home, foreign, Arc::new(DualCache::new()), nat))
    }

    pub fn with_parts(
        cfg: Arc<PeeringConfig>,
        home: Arc<dyn ClusterApi>,
        foreign: Arc<dyn ClusterApi>,
        cache: Arc<DualCache>,
        nat: Arc<NamespaceMapper>,
    ) -> Self {
        let forge = Translator::new(Arc::clone(&cfg), Arc::clone(&nat), Arc::clone(&cache));
        Self { cfg, home, foreign, cache, nat, forge }
    }

    pub fn cluster(&self, side: Side) -> &Arc<dyn ClusterApi> {
        match side {
            Side::Home => &self.home,
            Side::Foreign => &self.foreign,
        }
    }

    /// Namespace on the other side for `namespace` observed on `side`. Home namespaces are
    /// allocated on demand when `create` is set; foreign ones must already be mapped.
    pub fn counterpart_namespace(&self, side: Side, namespace: &str, create: bool) -> Result<String, NatError> {
        match side {
            Side::Home => self.nat.nat_namespace(namespace, create),
            Side::Foreign => self.nat.de_nat_namespace(namespace),
        }
    }

    /// Whether `namespace` on `side` takes part in this peering.
    pub fn is_mapped(&self, side: Side, namespace: &str) -> bool {
        match side {
            Side::Home => self.nat.is_home_mapped(namespace),
            Side::Foreign => self.nat.is_foreign_mapped(namespace),
        }
    }
}

/// A per-kind reconciliation loop body. Implementations are idempotent: any delta may be
/// replayed after a relist.
#[async_trait::async_trait]
pub trait Reflect: Send + Sync {
    fn name(&self) -> &'static str;

    /// `(side, kind)` streams whose deltas this reflector consumes.
    fn sources(&self) -> Vec<(Side, ResourceKind)>;

    async fn reconcile(&self, delta: &Delta) -> Result<Outcome, ReflectError>;
}

/// Treat `NotFound` as success, for deletes.
pub(crate) fn tolerate_not_found(res: Result<(), ClusterError>) -> Result<bool, ClusterError> {
    match res {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
