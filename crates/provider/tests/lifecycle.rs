#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use peerlink_core::labels::{HOME_POD_FINALIZER, OUTGOING_KEY, REFLECTED_POD_KEY};
use peerlink_core::{PeeringConfig, ResourceKind, Side, TrackedObject};
use peerlink_kubehub::fake::FakeCluster;
use peerlink_ops::{CancelHandle, ContainerUsage, PodUsage};
use peerlink_provider::{DeleteOrigin, LogChunk, LogOptions, PodLifecycle, PodOps, Provider, ProviderError, StreamHandle};
use peerlink_reflect::PeeringContext;
use tokio::sync::mpsc;

#[derive(Default)]
struct RecordingOps {
    calls: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl PodOps for RecordingOps {
    async fn logs(&self, namespace: &str, pod: &str, _opts: LogOptions) -> anyhow::Result<StreamHandle<LogChunk>> {
        self.calls.lock().unwrap().push(format!("logs {namespace}/{pod}"));
        let (tx, rx) = mpsc::channel(4);
        tx.send(LogChunk { line: "ready".into() }).await?;
        let (cancel, _watch) = CancelHandle::pair();
        Ok(StreamHandle { rx, cancel })
    }

    async fn pod_metrics(&self, namespace: &str, label_selector: &str) -> anyhow::Result<Vec<PodUsage>> {
        self.calls.lock().unwrap().push(format!("metrics {namespace} {label_selector}"));
        Ok(vec![
            PodUsage {
                namespace: namespace.into(),
                name: "frontend-0-x7k2p".into(),
                containers: vec![ContainerUsage { name: "main".into(), cpu_nano_cores: 120_000_000, memory_bytes: 48 << 20 }],
            },
            // Not in the cache: ignored.
            PodUsage { namespace: namespace.into(), name: "stranger".into(), containers: vec![] },
        ])
    }
}

struct Fixture {
    home: FakeCluster,
    foreign: FakeCluster,
    ops: Arc<RecordingOps>,
    provider: Provider,
}

fn fixture() -> Fixture {
    let mut cfg = PeeringConfig::new("abc123", "f-1");
    cfg.static_namespaces = vec![("web".into(), "web-abc123".into())];
    let home = FakeCluster::new("home");
    let foreign = FakeCluster::new("foreign");
    let ctx = PeeringContext::new(cfg, Arc::new(home.clone()), Arc::new(foreign.clone())).unwrap();
    let ops = Arc::new(RecordingOps::default());
    let provider = Provider::new(ctx, ops.clone());
    Fixture { home, foreign, ops, provider }
}

fn home_pod(name: &str) -> Pod {
    let mut p = Pod::default();
    p.metadata.namespace = Some("web".into());
    p.metadata.name = Some(name.into());
    p.spec = Some(PodSpec {
        node_name: Some("vk-f-1".into()),
        containers: vec![Container { name: "main".into(), image: Some("nginx".into()), ..Default::default() }],
        ..Default::default()
    });
    p
}

/// A foreign pod spawned by the ReplicaSet reflecting home pod `home_name`.
fn foreign_pod(name: &str, home_name: Option<&str>, phase: &str) -> TrackedObject {
    let mut p = Pod::default();
    p.metadata.namespace = Some("web-abc123".into());
    p.metadata.name = Some(name.into());
    p.metadata.resource_version = Some("1".into());
    let mut labels = BTreeMap::from([(OUTGOING_KEY.to_string(), "vk-f-1".to_string())]);
    if let Some(h) = home_name {
        labels.insert(REFLECTED_POD_KEY.to_string(), h.to_string());
    }
    p.metadata.labels = Some(labels);
    p.status = Some(PodStatus { phase: Some(phase.into()), pod_ip: Some("10.8.1.4".into()), ..Default::default() });
    TrackedObject::Pod(p)
}

fn replicaset(ns: &str, name: &str) -> ReplicaSet {
    let mut rs = ReplicaSet::default();
    rs.metadata.namespace = Some(ns.into());
    rs.metadata.name = Some(name.into());
    rs
}

#[tokio::test]
async fn create_pod_delegates_and_finalizes() {
    let f = fixture();
    let stored = f.home.insert(home_pod("frontend-0"));
    let pod = stored.as_pod().unwrap().clone();

    f.provider.create_pod(&pod).await.unwrap();

    let rs = f.foreign.object(ResourceKind::ReplicaSet, "web-abc123", "frontend-0").expect("replicaset");
    assert_eq!(rs.label(REFLECTED_POD_KEY), Some("frontend-0"));
    assert!(f.home.object(ResourceKind::Pod, "web", "frontend-0").unwrap().has_finalizer(HOME_POD_FINALIZER));
    f.provider.update_pod(&pod).await.unwrap();
    assert_eq!(f.foreign.calls().update, 0);
}

#[tokio::test]
async fn create_pod_skips_daemonset_pods() {
    let f = fixture();
    let mut pod = home_pod("agent-1");
    pod.metadata.owner_references =
        Some(vec![OwnerReference { kind: "DaemonSet".into(), name: "agent".into(), uid: "u".into(), ..Default::default() }]);
    let stored = f.home.insert(pod);

    f.provider.create_pod(stored.as_pod().unwrap()).await.unwrap();
    assert!(f.foreign.objects(ResourceKind::ReplicaSet).is_empty());
    assert_eq!(f.home.calls().patch, 0);
}

#[test]
fn reads_come_from_cache_and_degrade_to_absent() {
    let f = fixture();
    let cache = &f.provider.context().cache;
    cache.apply(Side::Foreign, foreign_pod("frontend-0-x7k2p", Some("frontend-0"), "Running"));

    let pod = f.provider.get_pod("web", "frontend-0").expect("home view");
    assert_eq!(pod.metadata.name.as_deref(), Some("frontend-0"));
    assert_eq!(pod.metadata.namespace.as_deref(), Some("web"));
    assert_eq!(pod.spec.as_ref().and_then(|s| s.node_name.as_deref()), Some("vk-f-1"));

    let status = f.provider.get_pod_status("web", "frontend-0").unwrap();
    assert_eq!(status.phase.as_deref(), Some("Running"));
    assert_eq!(f.provider.get_pods().len(), 1);

    assert!(f.provider.get_pod("web", "missing").is_none());
    assert!(f.provider.get_pod("unmapped", "frontend-0").is_none());
    assert!(f.provider.get_pod_status("unmapped", "frontend-0").is_none());
}

#[tokio::test]
async fn home_delete_removes_the_replicaset() {
    let f = fixture();
    f.foreign.insert(replicaset("web-abc123", "frontend-0"));

    f.provider.delete_pod(&home_pod("frontend-0"), DeleteOrigin::Home).await.unwrap();
    assert!(f.foreign.object(ResourceKind::ReplicaSet, "web-abc123", "frontend-0").is_none());

    // Already gone and never-mapped namespaces are both fine.
    f.provider.delete_pod(&home_pod("frontend-0"), DeleteOrigin::Home).await.unwrap();
    let mut elsewhere = home_pod("x");
    elsewhere.metadata.namespace = Some("unmapped".into());
    f.provider.delete_pod(&elsewhere, DeleteOrigin::Home).await.unwrap();
}

#[tokio::test]
async fn dangling_delete_needs_a_back_reference() {
    let f = fixture();
    f.foreign.insert(replicaset("web-abc123", "orphan-0"));
    let unlabeled = foreign_pod("orphan-0", None, "Running");

    f.provider.delete_pod(unlabeled.as_pod().unwrap(), DeleteOrigin::DanglingSweep).await.unwrap();
    assert!(f.foreign.object(ResourceKind::ReplicaSet, "web-abc123", "orphan-0").is_some());
    assert_eq!(f.foreign.calls().delete, 0);

    let labeled = foreign_pod("orphan-0-abcde", Some("orphan-0"), "Running");
    f.provider.delete_pod(labeled.as_pod().unwrap(), DeleteOrigin::DanglingSweep).await.unwrap();
    assert!(f.foreign.object(ResourceKind::ReplicaSet, "web-abc123", "orphan-0").is_none());
}

#[tokio::test]
async fn sweep_removes_only_orphans() {
    let f = fixture();
    f.home.insert(home_pod("alive-0"));
    f.foreign.insert(replicaset("web-abc123", "alive-0"));
    f.foreign.insert(replicaset("web-abc123", "gone-0"));
    let cache = &f.provider.context().cache;
    cache.apply(Side::Foreign, foreign_pod("alive-0-aaaaa", Some("alive-0"), "Running"));
    cache.apply(Side::Foreign, foreign_pod("gone-0-bbbbb", Some("gone-0"), "Running"));

    assert_eq!(f.provider.sweep_dangling().await.unwrap(), 1);
    assert!(f.foreign.object(ResourceKind::ReplicaSet, "web-abc123", "alive-0").is_some());
    assert!(f.foreign.object(ResourceKind::ReplicaSet, "web-abc123", "gone-0").is_none());
}

#[tokio::test]
async fn logs_are_proxied_to_the_foreign_pod() {
    let f = fixture();
    f.provider.context().cache.apply(Side::Foreign, foreign_pod("frontend-0-x7k2p", Some("frontend-0"), "Running"));

    let mut handle = f.provider.get_container_logs("web", "frontend-0", LogOptions::default()).await.unwrap();
    assert_eq!(handle.rx.recv().await.unwrap().line, "ready");
    handle.cancel.cancel();
    assert_eq!(f.ops.calls.lock().unwrap().as_slice(), ["logs web-abc123/frontend-0-x7k2p"]);

    let err = f.provider.get_container_logs("web", "nope", LogOptions::default()).await.err().unwrap();
    assert!(matches!(err, ProviderError::NotFound(_)));
}

#[tokio::test]
async fn exec_reports_unsupported_backends() {
    let f = fixture();
    f.provider.context().cache.apply(Side::Foreign, foreign_pod("frontend-0-x7k2p", Some("frontend-0"), "Running"));
    let err = f.provider.run_in_container("web", "frontend-0", Default::default(), Default::default()).await.err().unwrap();
    assert!(matches!(err, ProviderError::Internal(ref m) if m.contains("not supported")));
}

#[tokio::test]
async fn stats_are_attributed_to_home_pods() {
    let f = fixture();
    f.provider.context().cache.apply(Side::Foreign, foreign_pod("frontend-0-x7k2p", Some("frontend-0"), "Running"));

    let summary = f.provider.get_stats_summary().await.unwrap();
    assert_eq!(summary.node.node_name, "vk-f-1");
    assert_eq!(summary.pods.len(), 1);
    assert_eq!(summary.pods[0].name, "frontend-0");
    assert_eq!(summary.pods[0].namespace, "web");
    assert_eq!(summary.node.cpu_nano_cores, 120_000_000);
    let calls = f.ops.calls.lock().unwrap().clone();
    assert_eq!(calls, vec![format!("metrics web-abc123 {OUTGOING_KEY}=vk-f-1")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn notifications_carry_home_shaped_pods() {
    let f = fixture();
    let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let _h = f.provider.notify_pods(move |pod| {
        let phase = pod.status.and_then(|s| s.phase).unwrap_or_default();
        sink.lock().unwrap().push((pod.metadata.name.unwrap_or_default(), phase));
    });

    let cache = &f.provider.context().cache;
    cache.apply(Side::Foreign, foreign_pod("frontend-0-x7k2p", Some("frontend-0"), "Pending"));
    // Pods without a back-reference are not ours to report.
    cache.apply(Side::Foreign, foreign_pod("unrelated", None, "Running"));
    let mut next = foreign_pod("frontend-0-x7k2p", Some("frontend-0"), "Running");
    next.meta_mut().resource_version = Some("2".into());
    cache.apply(Side::Foreign, next);

    let deadline = Instant::now() + Duration::from_secs(2);
    while seen.lock().unwrap().len() < 2 {
        assert!(Instant::now() < deadline, "notifications not delivered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        [("frontend-0".to_string(), "Pending".to_string()), ("frontend-0".to_string(), "Running".to_string())]
    );
}
