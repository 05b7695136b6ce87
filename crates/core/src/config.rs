//! Static per-peering configuration handed to the engine by the peering negotiation.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ResourceKind, Side};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Direction an Endpoints reflector copies addresses in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointsDirection {
    ForeignToHome,
    HomeToForeign,
}

impl EndpointsDirection {
    pub fn source(self) -> Side {
        match self {
            EndpointsDirection::ForeignToHome => Side::Foreign,
            EndpointsDirection::HomeToForeign => Side::Home,
        }
    }

    pub fn destination(self) -> Side {
        self.source().opposite()
    }
}

impl FromStr for EndpointsDirection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "foreign-to-home" => Ok(EndpointsDirection::ForeignToHome),
            "home-to-foreign" => Ok(EndpointsDirection::HomeToForeign),
            other => Err(ConfigError::Invalid { key: "PEERLINK_ENDPOINTS_DIRECTIONS", value: other.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeeringConfig {
    pub home_cluster_id: String,
    pub foreign_cluster_id: String,
    /// Node names starting with this prefix belong to virtual nodes; addresses on them are never reflected.
    pub virtual_node_prefix: String,
    pub virtual_node_name: String,
    pub reflected_kinds: BTreeSet<ResourceKind>,
    pub endpoints_directions: BTreeSet<EndpointsDirection>,
    pub endpoint_slices: bool,
    pub queue_cap: usize,
    pub watch_backoff_max_secs: u64,
    /// Pre-agreed `(home, foreign)` namespace pairs.
    #[serde(default)]
    pub static_namespaces: Vec<(String, String)>,
}

impl PeeringConfig {
    /// Minimal configuration with defaults for everything but the cluster ids.
    pub fn new(home_cluster_id: impl Into<String>, foreign_cluster_id: impl Into<String>) -> Self {
        let foreign_cluster_id = foreign_cluster_id.into();
        let virtual_node_prefix = "vk".to_string();
        Self {
            home_cluster_id: home_cluster_id.into(),
            virtual_node_name: format!("{}-{}", virtual_node_prefix, foreign_cluster_id),
            foreign_cluster_id,
            virtual_node_prefix,
            reflected_kinds: [ResourceKind::Pod, ResourceKind::Service, ResourceKind::Endpoints].into_iter().collect(),
            endpoints_directions: [EndpointsDirection::ForeignToHome].into_iter().collect(),
            endpoint_slices: true,
            queue_cap: 1024,
            watch_backoff_max_secs: 30,
            static_namespaces: Vec::new(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary key lookup (environment by default).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = lookup("PEERLINK_HOME_CLUSTER_ID").filter(|s| !s.is_empty()).ok_or(ConfigError::Missing("PEERLINK_HOME_CLUSTER_ID"))?;
        let foreign = lookup("PEERLINK_FOREIGN_CLUSTER_ID").filter(|s| !s.is_empty()).ok_or(ConfigError::Missing("PEERLINK_FOREIGN_CLUSTER_ID"))?;
        let mut cfg = Self::new(home, foreign);

        if let Some(prefix) = lookup("PEERLINK_VIRTUAL_NODE_PREFIX").filter(|s| !s.is_empty()) {
            cfg.virtual_node_name = format!("{}-{}", prefix, cfg.foreign_cluster_id);
            cfg.virtual_node_prefix = prefix;
        }
        if let Some(name) = lookup("PEERLINK_VIRTUAL_NODE_NAME").filter(|s| !s.is_empty()) {
            cfg.virtual_node_name = name;
        }
        if let Some(list) = lookup("PEERLINK_REFLECT") {
            cfg.reflected_kinds = split_list(&list)
                .map(|s| s.parse::<ResourceKind>().map_err(|_| ConfigError::Invalid { key: "PEERLINK_REFLECT", value: s.to_string() }))
                .collect::<Result<_, _>>()?;
        }
        if let Some(list) = lookup("PEERLINK_ENDPOINTS_DIRECTIONS") {
            cfg.endpoints_directions = split_list(&list).map(str::parse::<EndpointsDirection>).collect::<Result<_, _>>()?;
        }
        if let Some(v) = lookup("PEERLINK_ENDPOINT_SLICES") {
            cfg.endpoint_slices = parse_bool(&v).ok_or(ConfigError::Invalid { key: "PEERLINK_ENDPOINT_SLICES", value: v.clone() })?;
        }
        if let Some(v) = lookup("PEERLINK_QUEUE_CAP") {
            cfg.queue_cap = v.parse().map_err(|_| ConfigError::Invalid { key: "PEERLINK_QUEUE_CAP", value: v.clone() })?;
        }
        if let Some(v) = lookup("PEERLINK_WATCH_BACKOFF_MAX_SECS") {
            cfg.watch_backoff_max_secs = v.parse().map_err(|_| ConfigError::Invalid { key: "PEERLINK_WATCH_BACKOFF_MAX_SECS", value: v.clone() })?;
        }
        if let Some(v) = lookup("PEERLINK_NAMESPACES") {
            cfg.static_namespaces = parse_namespace_pairs(&v)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.home_cluster_id.is_empty() {
            return Err(ConfigError::Missing("home_cluster_id"));
        }
        if self.foreign_cluster_id.is_empty() {
            return Err(ConfigError::Missing("foreign_cluster_id"));
        }
        // The virtual node must itself be filtered by the loop-avoidance prefix.
        if !self.virtual_node_name.starts_with(&self.virtual_node_prefix) {
            return Err(ConfigError::Invalid { key: "virtual_node_name", value: self.virtual_node_name.clone() });
        }
        if self.queue_cap == 0 {
            return Err(ConfigError::Invalid { key: "queue_cap", value: "0".into() });
        }
        Ok(())
    }

    pub fn cluster_id(&self, side: Side) -> &str {
        match side {
            Side::Home => &self.home_cluster_id,
            Side::Foreign => &self.foreign_cluster_id,
        }
    }

    pub fn reflects(&self, kind: ResourceKind) -> bool {
        self.reflected_kinds.contains(&kind)
    }

    pub fn is_virtual_node(&self, node_name: &str) -> bool {
        node_name.starts_with(&self.virtual_node_prefix)
    }
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse `home=foreign,home2=foreign2`.
pub fn parse_namespace_pairs(s: &str) -> Result<Vec<(String, String)>, ConfigError> {
    split_list(s)
        .map(|pair| match pair.split_once('=') {
            Some((h, f)) if !h.trim().is_empty() && !f.trim().is_empty() => Ok((h.trim().to_string(), f.trim().to_string())),
            _ => Err(ConfigError::Invalid { key: "PEERLINK_NAMESPACES", value: pair.to_string() }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_derive_virtual_node_name() {
        let cfg = PeeringConfig::from_lookup(lookup(&[
            ("PEERLINK_HOME_CLUSTER_ID", "home-1"),
            ("PEERLINK_FOREIGN_CLUSTER_ID", "abc123"),
        ]))
        .unwrap();
        assert_eq!(cfg.virtual_node_name, "vk-abc123");
        assert!(cfg.reflects(ResourceKind::Pod));
        assert!(cfg.endpoint_slices);
        assert!(cfg.is_virtual_node("vk-abc123"));
        assert!(!cfg.is_virtual_node("worker-1"));
    }

    #[test]
    fn missing_cluster_id_is_rejected() {
        let err = PeeringConfig::from_lookup(lookup(&[("PEERLINK_HOME_CLUSTER_ID", "h")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("PEERLINK_FOREIGN_CLUSTER_ID")));
    }

    #[test]
    fn parses_lists_and_pairs() {
        let cfg = PeeringConfig::from_lookup(lookup(&[
            ("PEERLINK_HOME_CLUSTER_ID", "h"),
            ("PEERLINK_FOREIGN_CLUSTER_ID", "f"),
            ("PEERLINK_REFLECT", "pods, services"),
            ("PEERLINK_ENDPOINTS_DIRECTIONS", "foreign-to-home,home-to-foreign"),
            ("PEERLINK_ENDPOINT_SLICES", "off"),
            ("PEERLINK_NAMESPACES", "web=web-h,db=db-h"),
        ]))
        .unwrap();
        assert!(!cfg.reflects(ResourceKind::Endpoints));
        assert_eq!(cfg.endpoints_directions.len(), 2);
        assert!(!cfg.endpoint_slices);
        assert_eq!(cfg.static_namespaces, vec![("web".into(), "web-h".into()), ("db".into(), "db-h".into())]);
    }

    #[test]
    fn virtual_node_name_must_carry_prefix() {
        let err = PeeringConfig::from_lookup(lookup(&[
            ("PEERLINK_HOME_CLUSTER_ID", "h"),
            ("PEERLINK_FOREIGN_CLUSTER_ID", "f"),
            ("PEERLINK_VIRTUAL_NODE_NAME", "remote-f"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "virtual_node_name", .. }));
    }

    #[test]
    fn bad_namespace_pair_is_invalid() {
        assert!(parse_namespace_pairs("web=,x").is_err());
    }
}
