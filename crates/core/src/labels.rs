//! Wire-level label, annotation and finalizer keys shared with peered clusters.
//!
//! These strings are part of the interoperability contract: renaming them breaks
//! loop avoidance and ownership tracing on clusters already peered.

/// Label on foreign objects carrying the name of the home pod they reflect.
pub const REFLECTED_POD_KEY: &str = "virtualkubelet.liqo.io/reflectedpod";

/// Label on foreign ReplicaSets/pods carrying the virtual node name they were delegated through.
pub const OUTGOING_KEY: &str = "virtualkubelet.liqo.io/outgoing";

/// Label on reflected Services/Endpoints carrying the originating cluster id.
pub const REFLECTION_KEY: &str = "virtualkubelet.liqo.io/reflection";

/// Finalizer attached to home pods while a foreign ReplicaSet exists for them.
pub const HOME_POD_FINALIZER: &str = "virtual-kubelet.liqo.io/provider";

pub const ENDPOINT_SLICE_MANAGED_BY_KEY: &str = "endpointslice.kubernetes.io/managed-by";
pub const ENDPOINT_SLICE_MANAGED_BY: &str = "vk";
pub const ENDPOINT_SLICE_SERVICE_NAME_KEY: &str = "kubernetes.io/service-name";

/// Label selector matching foreign pods delegated through `node_name`.
pub fn outgoing_selector(node_name: &str) -> String {
    format!("{}={}", OUTGOING_KEY, node_name)
}
