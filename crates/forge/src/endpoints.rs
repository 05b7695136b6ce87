//! Endpoints reflection and EndpointSlice generation.
//!
//! Both apply the same loop-avoidance filter: an address is reflected only when it names the
//! node it runs on and that node is not a virtual node.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints, Service};
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort, EndpointSlice};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use peerlink_core::labels::{ENDPOINT_SLICE_MANAGED_BY, ENDPOINT_SLICE_MANAGED_BY_KEY, ENDPOINT_SLICE_SERVICE_NAME_KEY, REFLECTION_KEY};

use crate::TranslateError;

/// Copy of `addr` fit for the other cluster, or `None` when it must not be reflected.
pub fn qualifying_address(addr: &EndpointAddress, virtual_prefix: &str) -> Option<EndpointAddress> {
    match addr.node_name.as_deref() {
        Some(node) if !node.starts_with(virtual_prefix) => Some(EndpointAddress {
            ip: addr.ip.clone(),
            hostname: addr.hostname.clone(),
            node_name: None,
            target_ref: None,
        }),
        _ => None,
    }
}

/// Destination Endpoints for `source`, or `None` when no address survives the filter.
///
/// `None` means "no update needed"; it is never turned into an empty update, which would
/// advertise the service as fully unavailable.
pub fn translate_endpoints(source: &Endpoints, destination_ns: &str, virtual_prefix: &str, origin_cluster_id: &str) -> Option<Endpoints> {
    let subsets: Vec<EndpointSubset> = source
        .subsets
        .iter()
        .flatten()
        .filter_map(|subset| {
            let addresses: Vec<EndpointAddress> = subset.addresses.iter().flatten().filter_map(|a| qualifying_address(a, virtual_prefix)).collect();
            if addresses.is_empty() {
                return None;
            }
            Some(EndpointSubset { addresses: Some(addresses), not_ready_addresses: None, ports: subset.ports.clone() })
        })
        .collect();
    if subsets.is_empty() {
        return None;
    }
    let mut labels = source.metadata.labels.clone().unwrap_or_default();
    labels.insert(REFLECTION_KEY.to_string(), origin_cluster_id.to_string());
    Some(Endpoints {
        metadata: ObjectMeta {
            name: source.metadata.name.clone(),
            namespace: Some(destination_ns.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        subsets: Some(subsets),
    })
}

/// Whether `desired` would change anything on `current`.
pub fn endpoints_equivalent(desired: &Endpoints, current: &Endpoints) -> bool {
    desired.subsets.as_deref().unwrap_or_default() == current.subsets.as_deref().unwrap_or_default()
}

/// EndpointSlice for `service` built from `endpoints`.
///
/// Returns `Ok(None)` when any subset has no qualifying address: a slice is taken as complete
/// for its service, so a partial one is never emitted.
pub fn endpoint_slice(service: &Service, endpoints: &Endpoints, virtual_prefix: &str) -> Result<Option<EndpointSlice>, TranslateError> {
    let name = service.metadata.name.clone().ok_or(TranslateError::MissingField("metadata.name"))?;
    let mut slice_endpoints = Vec::new();
    let mut ports = Vec::new();

    for subset in endpoints.subsets.iter().flatten() {
        let mut any = false;
        for addr in subset.addresses.iter().flatten() {
            let node = addr.node_name.as_deref().ok_or(TranslateError::MissingField("subsets.addresses.nodeName"))?;
            if node.starts_with(virtual_prefix) {
                continue;
            }
            slice_endpoints.push(Endpoint {
                addresses: vec![addr.ip.clone()],
                conditions: Some(EndpointConditions { ready: Some(true), ..Default::default() }),
                ..Default::default()
            });
            any = true;
        }
        if !any {
            return Ok(None);
        }
        ports.extend(subset.ports.iter().flatten().map(|p| EndpointPort {
            name: Some(p.name.clone().unwrap_or_default()),
            protocol: p.protocol.clone(),
            port: Some(p.port),
            app_protocol: p.app_protocol.clone(),
        }));
    }

    let labels = BTreeMap::from([
        (ENDPOINT_SLICE_MANAGED_BY_KEY.to_string(), ENDPOINT_SLICE_MANAGED_BY.to_string()),
        (ENDPOINT_SLICE_SERVICE_NAME_KEY.to_string(), name.clone()),
    ]);
    Ok(Some(EndpointSlice {
        metadata: ObjectMeta { name: Some(name), namespace: service.metadata.namespace.clone(), labels: Some(labels), ..Default::default() },
        address_type: "IPv4".to_string(),
        endpoints: slice_endpoints,
        ports: Some(ports),
    }))
}
