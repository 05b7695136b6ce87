use peerlink_ops::{ContainerUsage, PodUsage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStats {
    pub node_name: String,
    pub cpu_nano_cores: u64,
    pub memory_bytes: u64,
}

/// Usage of one home pod, measured on its foreign counterpart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStats {
    pub namespace: String,
    pub name: String,
    pub cpu_nano_cores: u64,
    pub memory_bytes: u64,
    pub containers: Vec<ContainerUsage>,
}

impl PodStats {
    pub fn attributed(home_namespace: &str, home_name: &str, usage: PodUsage) -> Self {
        Self {
            namespace: home_namespace.to_string(),
            name: home_name.to_string(),
            cpu_nano_cores: usage.cpu_nano_cores(),
            memory_bytes: usage.memory_bytes(),
            containers: usage.containers,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSummary {
    pub node: NodeStats,
    pub pods: Vec<PodStats>,
}

impl StatsSummary {
    pub fn new(node_name: &str) -> Self {
        Self { node: NodeStats { node_name: node_name.to_string(), ..Default::default() }, pods: Vec::new() }
    }

    /// Add a pod and fold it into the node totals.
    pub fn push(&mut self, pod: PodStats) {
        self.node.cpu_nano_cores += pod.cpu_nano_cores;
        self.node.memory_bytes += pod.memory_bytes;
        self.pods.push(pod);
    }
}
