//! Peerlink namespace NAT: a bijective home ↔ foreign namespace table scoped to one peering.
//!
//! Mappings are created lazily on the first write-path lookup and never change afterwards;
//! rewriting one would orphan every object already reflected under the old name.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Longest namespace name the API server accepts (DNS-1123 label).
const MAX_NAMESPACE_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NatError {
    #[error("namespace {0} is not mapped")]
    NotFound(String),
    #[error("namespace collision: {foreign} already maps {existing}, refusing to map {requested}")]
    Collision { foreign: String, existing: String, requested: String },
    #[error("namespace {home} cannot be remapped from {current} to {requested}")]
    Immutable { home: String, current: String, requested: String },
    #[error("invalid namespace name {0}")]
    InvalidName(String),
}

impl NatError {
    /// Collisions and invalid names mean the peering itself is misconfigured.
    pub fn is_configuration_defect(&self) -> bool {
        !matches!(self, NatError::NotFound(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceMapping {
    pub home_namespace: String,
    pub foreign_namespace: String,
    pub home_cluster_id: String,
}

#[derive(Debug, Default)]
struct NatTable {
    forward: BTreeMap<String, NamespaceMapping>,
    reverse: BTreeMap<String, String>,
}

pub struct NamespaceMapper {
    home_cluster_id: String,
    table: RwLock<NatTable>,
    epoch_tx: watch::Sender<u64>,
}

impl NamespaceMapper {
    pub fn new(home_cluster_id: impl Into<String>) -> Self {
        let (epoch_tx, _rx) = watch::channel(0u64);
        Self { home_cluster_id: home_cluster_id.into(), table: RwLock::new(NatTable::default()), epoch_tx }
    }

    /// Mapper pre-seeded with agreed `(home, foreign)` pairs.
    pub fn with_static<I, H, F>(home_cluster_id: impl Into<String>, pairs: I) -> Result<Self, NatError>
    where
        I: IntoIterator<Item = (H, F)>,
        H: Into<String>,
        F: Into<String>,
    {
        let mapper = Self::new(home_cluster_id);
        for (h, f) in pairs {
            mapper.insert(h.into(), f.into())?;
        }
        Ok(mapper)
    }

    pub fn home_cluster_id(&self) -> &str {
        &self.home_cluster_id
    }

    /// Translate a home namespace. With `create` the mapping is allocated if missing
    /// (idempotently); without it a missing mapping is `NotFound`.
    pub fn nat_namespace(&self, home: &str, create: bool) -> Result<String, NatError> {
        {
            let t = self.table.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(m) = t.forward.get(home) {
                return Ok(m.foreign_namespace.clone());
            }
        }
        if !create {
            return Err(NatError::NotFound(home.to_string()));
        }
        let foreign = self.derive_foreign(home)?;
        self.insert(home.to_string(), foreign)
    }

    /// Reverse lookup: home namespace for a foreign one.
    pub fn de_nat_namespace(&self, foreign: &str) -> Result<String, NatError> {
        let t = self.table.read().unwrap_or_else(PoisonError::into_inner);
        t.reverse.get(foreign).cloned().ok_or_else(|| NatError::NotFound(foreign.to_string()))
    }

    /// Snapshot of `home → foreign`.
    pub fn mapped_namespaces(&self) -> BTreeMap<String, String> {
        let t = self.table.read().unwrap_or_else(PoisonError::into_inner);
        t.forward.iter().map(|(h, m)| (h.clone(), m.foreign_namespace.clone())).collect()
    }

    pub fn mappings(&self) -> Vec<NamespaceMapping> {
        let t = self.table.read().unwrap_or_else(PoisonError::into_inner);
        t.forward.values().cloned().collect()
    }

    pub fn is_home_mapped(&self, home: &str) -> bool {
        self.table.read().unwrap_or_else(PoisonError::into_inner).forward.contains_key(home)
    }

    pub fn is_foreign_mapped(&self, foreign: &str) -> bool {
        self.table.read().unwrap_or_else(PoisonError::into_inner).reverse.contains_key(foreign)
    }

    /// Receiver bumped every time a new mapping is added.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    fn derive_foreign(&self, home: &str) -> Result<String, NatError> {
        let foreign = format!("{}-{}", home, self.home_cluster_id);
        if !is_dns_label(&foreign) {
            return Err(NatError::InvalidName(foreign));
        }
        Ok(foreign)
    }

    fn insert(&self, home: String, foreign: String) -> Result<String, NatError> {
        if !is_dns_label(&home) {
            return Err(NatError::InvalidName(home));
        }
        if !is_dns_label(&foreign) {
            return Err(NatError::InvalidName(foreign));
        }
        let mut t = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = t.forward.get(&home) {
            // Lost a race with another creator for the same namespace.
            if existing.foreign_namespace == foreign {
                return Ok(foreign);
            }
            let err = NatError::Immutable { home, current: existing.foreign_namespace.clone(), requested: foreign };
            error!(error = %err, "namespace mapping rejected");
            return Err(err);
        }
        if let Some(owner) = t.reverse.get(&foreign) {
            let err = NatError::Collision { foreign: foreign.clone(), existing: owner.clone(), requested: home };
            error!(error = %err, "namespace mapping rejected");
            return Err(err);
        }
        t.reverse.insert(foreign.clone(), home.clone());
        t.forward.insert(
            home.clone(),
            NamespaceMapping { home_namespace: home.clone(), foreign_namespace: foreign.clone(), home_cluster_id: self.home_cluster_id.clone() },
        );
        let total = t.forward.len();
        drop(t);
        self.epoch_tx.send_modify(|e| *e += 1);
        info!(home = %home, foreign = %foreign, total, "namespace mapped");
        debug!(cluster = %self.home_cluster_id, "nat epoch bumped");
        Ok(foreign)
    }
}

fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_NAMESPACE_LEN
        && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}
