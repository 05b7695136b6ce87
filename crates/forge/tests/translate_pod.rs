#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use peerlink_core::labels::{OUTGOING_KEY, REFLECTED_POD_KEY};
use peerlink_core::{PeeringConfig, Side, TrackedObject};
use peerlink_forge::Translator;
use peerlink_nat::NamespaceMapper;
use peerlink_store::DualCache;

fn translator() -> (Translator, Arc<DualCache>, Arc<NamespaceMapper>) {
    let cfg = Arc::new(PeeringConfig::new("abc123", "f-1"));
    let nat = Arc::new(NamespaceMapper::new("abc123"));
    let cache = Arc::new(DualCache::new());
    (Translator::new(cfg, Arc::clone(&nat), Arc::clone(&cache)), cache, nat)
}

fn frontend() -> Pod {
    Pod {
        metadata: ObjectMeta { name: Some("frontend-0".into()), namespace: Some("web".into()), ..Default::default() },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "app".into(),
                env: Some(vec![EnvVar { name: "DB_HOST".into(), value: Some("db.web.svc".into()), value_from: None }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    }
}

#[test]
fn frontend_reflects_with_rewritten_db_host() {
    let (t, cache, nat) = translator();
    let mut db = Service::default();
    db.metadata.name = Some("db".into());
    db.metadata.namespace = Some("web".into());
    db.metadata.resource_version = Some("1".into());
    cache.apply(Side::Home, TrackedObject::Service(db));

    let rs = t.replicaset_for(&frontend()).unwrap().unwrap();
    assert_eq!(rs.metadata.name.as_deref(), Some("frontend-0"));
    assert_eq!(rs.metadata.namespace.as_deref(), Some("web-abc123"));
    assert_eq!(nat.nat_namespace("web", false).unwrap(), "web-abc123");

    let tpl = rs.spec.unwrap().template.unwrap();
    let labels = tpl.metadata.unwrap().labels.unwrap();
    assert_eq!(labels.get(REFLECTED_POD_KEY).map(String::as_str), Some("frontend-0"));
    assert_eq!(labels.get(OUTGOING_KEY).map(String::as_str), Some("vk-f-1"));
    let env = tpl.spec.unwrap().containers[0].env.clone().unwrap();
    assert_eq!(env[0].value.as_deref(), Some("db.web-abc123.svc"));
}

#[test]
fn unknown_service_reference_is_kept() {
    let (t, _cache, _nat) = translator();
    let rs = t.replicaset_for(&frontend()).unwrap().unwrap();
    let env = rs.spec.unwrap().template.unwrap().spec.unwrap().containers[0].env.clone().unwrap();
    assert_eq!(env[0].value.as_deref(), Some("db.web.svc"));
}

#[test]
fn daemonset_pod_never_yields_a_replicaset() {
    let (t, _cache, nat) = translator();
    let mut p = frontend();
    p.metadata.owner_references = Some(vec![OwnerReference { kind: "DaemonSet".into(), name: "agent".into(), ..Default::default() }]);
    // Even a malformed spec does not matter.
    p.spec = None;
    assert!(t.replicaset_for(&p).unwrap().is_none());
    assert!(nat.mapped_namespaces().is_empty());
}

#[test]
fn foreign_pod_in_unmapped_namespace_fails_translation() {
    let (t, _cache, _nat) = translator();
    let mut foreign = Pod::default();
    foreign.metadata.namespace = Some("nowhere".into());
    assert!(t.home_pod_for(&foreign, None).is_err());
}
