//! Pod ↔ ReplicaSet wrapping.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use peerlink_core::labels::{OUTGOING_KEY, REFLECTED_POD_KEY};

use crate::TranslateError;

/// Projected service-account volumes; they point at home-cluster tokens.
const TOKEN_VOLUME_PREFIXES: [&str; 2] = ["kube-api-access-", "default-token-"];

/// Label added by the foreign ReplicaSet controller to its pods.
const POD_TEMPLATE_HASH: &str = "pod-template-hash";

pub fn is_daemonset_owned(pod: &Pod) -> bool {
    pod.metadata.owner_references.as_deref().unwrap_or_default().iter().any(|o| o.kind == "DaemonSet")
}

fn is_token_volume(name: &str) -> bool {
    TOKEN_VOLUME_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn without_token_mounts(c: &Container) -> Container {
    let mut out = c.clone();
    out.volume_mounts = c
        .volume_mounts
        .as_ref()
        .map(|ms| ms.iter().filter(|m| !is_token_volume(&m.name)).cloned().collect::<Vec<_>>())
        .filter(|ms| !ms.is_empty());
    out
}

/// Pod spec as it should run on the foreign cluster: no home node binding, no home
/// service account, restart handled by the foreign ReplicaSet.
fn foreign_pod_spec(home: &PodSpec) -> Result<PodSpec, TranslateError> {
    if home.containers.is_empty() {
        return Err(TranslateError::MissingField("spec.containers"));
    }
    let mut spec = home.clone();
    spec.containers = home.containers.iter().map(without_token_mounts).collect();
    spec.init_containers = home.init_containers.as_ref().map(|cs| cs.iter().map(without_token_mounts).collect());
    spec.volumes = home
        .volumes
        .as_ref()
        .map(|vs| vs.iter().filter(|v| !is_token_volume(&v.name)).cloned().collect::<Vec<_>>())
        .filter(|vs| !vs.is_empty());
    spec.node_name = None;
    spec.node_selector = None;
    spec.affinity = None;
    spec.service_account = None;
    spec.service_account_name = None;
    spec.automount_service_account_token = Some(false);
    spec.restart_policy = Some("Always".to_string());
    Ok(spec)
}

/// Wrap `home` in a single-replica ReplicaSet named after it in `foreign_ns`.
pub fn replicaset_from_pod(home: &Pod, foreign_ns: &str, virtual_node: &str) -> Result<ReplicaSet, TranslateError> {
    let name = home.metadata.name.as_deref().ok_or(TranslateError::MissingField("metadata.name"))?;
    let spec = home.spec.as_ref().ok_or(TranslateError::MissingField("spec"))?;
    let spec = foreign_pod_spec(spec)?;

    let selector: BTreeMap<String, String> = [
        (REFLECTED_POD_KEY.to_string(), name.to_string()),
        (OUTGOING_KEY.to_string(), virtual_node.to_string()),
    ]
    .into();
    let mut labels = home.metadata.labels.clone().unwrap_or_default();
    labels.extend(selector.clone());

    Ok(ReplicaSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(foreign_ns.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ReplicaSetSpec {
            replicas: Some(1),
            selector: LabelSelector { match_labels: Some(selector), ..Default::default() },
            template: Some(PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: home.metadata.annotations.clone(),
                    ..Default::default()
                }),
                spec: Some(spec),
            }),
            ..Default::default()
        }),
        status: None,
    })
}

/// Home-shaped pod for a foreign one. The name comes from the back-reference label; when the
/// cached home pod is given it is the base and only the status is taken from `foreign`.
pub fn home_pod_from_foreign(foreign: &Pod, home: Option<&Pod>, home_ns: &str, virtual_node: &str) -> Result<Pod, TranslateError> {
    let name = foreign
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(REFLECTED_POD_KEY))
        .ok_or(TranslateError::MissingField("metadata.labels[reflectedpod]"))?;

    if let Some(home) = home {
        let mut out = home.clone();
        out.status = foreign.status.clone();
        return Ok(out);
    }

    let labels: BTreeMap<String, String> = foreign
        .metadata
        .labels
        .iter()
        .flatten()
        .filter(|(k, _)| !matches!(k.as_str(), REFLECTED_POD_KEY | OUTGOING_KEY | POD_TEMPLATE_HASH))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let mut spec = foreign.spec.clone().unwrap_or_default();
    spec.node_name = Some(virtual_node.to_string());
    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(home_ns.to_string()),
            labels: Some(labels).filter(|l| !l.is_empty()),
            annotations: foreign.metadata.annotations.clone(),
            creation_timestamp: foreign.metadata.creation_timestamp.clone(),
            ..Default::default()
        },
        spec: Some(spec),
        status: foreign.status.clone(),
    })
}
