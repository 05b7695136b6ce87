//! Peerlink ops: passthrough pod operations against a single cluster.
//! Logs and exec are proxied as streams; pod metrics come from `metrics.k8s.io`.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::StreamExt;
use kube::{
    api::{Api, AttachParams, ListParams, LogParams, TerminalSize},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// A single chunk of log output (line oriented).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunk {
    pub line: String,
}

/// Options for `logs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogOptions {
    pub container: Option<String>,
    pub follow: bool,
    pub previous: bool,
    pub timestamps: bool,
    /// Tail last n lines (server-side)
    pub tail_lines: Option<i64>,
    pub since_seconds: Option<i64>,
    pub limit_bytes: Option<i64>,
}

/// Cancellation handle for an in-flight operation.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    /// A handle plus the receiver the producing task watches.
    pub fn pair() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Result of starting a streaming operation.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub container: Option<String>,
    pub command: Vec<String>,
    pub tty: bool,
}

/// Caller side of an exec session. Absent channels are not attached.
#[derive(Default)]
pub struct ExecIo {
    pub stdin: Option<mpsc::Receiver<Bytes>>,
    pub stdout: Option<mpsc::Sender<Bytes>>,
    pub stderr: Option<mpsc::Sender<Bytes>>,
    /// `(width, height)` updates for TTY sessions.
    pub resize: Option<mpsc::Receiver<(u16, u16)>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerUsage {
    pub name: String,
    pub cpu_nano_cores: u64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodUsage {
    pub namespace: String,
    pub name: String,
    pub containers: Vec<ContainerUsage>,
}

impl PodUsage {
    pub fn cpu_nano_cores(&self) -> u64 {
        self.containers.iter().map(|c| c.cpu_nano_cores).sum()
    }

    pub fn memory_bytes(&self) -> u64 {
        self.containers.iter().map(|c| c.memory_bytes).sum()
    }
}

/// Passthrough pod operations. Only `logs` is mandatory.
#[allow(unused_variables)]
#[async_trait::async_trait]
pub trait PodOps: Send + Sync {
    async fn logs(&self, namespace: &str, pod: &str, opts: LogOptions) -> Result<StreamHandle<LogChunk>>;

    async fn exec(&self, namespace: &str, pod: &str, req: ExecRequest, io: ExecIo) -> Result<()> {
        Err(anyhow!("exec: not supported"))
    }

    /// Usage for pods in `namespace` matching `label_selector`.
    async fn pod_metrics(&self, namespace: &str, label_selector: &str) -> Result<Vec<PodUsage>> {
        Err(anyhow!("pod metrics: not supported"))
    }
}

/// kube-rs implementation bound to one cluster's client.
#[derive(Clone)]
pub struct KubeOps {
    client: Client,
}

impl KubeOps {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn queue_cap() -> usize {
    std::env::var("PEERLINK_OPS_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(1024)
}

#[async_trait::async_trait]
impl PodOps for KubeOps {
    async fn logs(&self, namespace: &str, pod: &str, opts: LogOptions) -> Result<StreamHandle<LogChunk>> {
        use k8s_openapi::api::core::v1::Pod;

        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = LogParams {
            container: opts.container.clone(),
            follow: opts.follow,
            previous: opts.previous,
            timestamps: opts.timestamps,
            tail_lines: opts.tail_lines,
            since_seconds: opts.since_seconds,
            limit_bytes: opts.limit_bytes,
            ..LogParams::default()
        };

        let (tx, rx) = mpsc::channel::<LogChunk>(queue_cap());
        let (cancel, cancel_rx) = CancelHandle::pair();

        // Open eagerly so a missing pod/container is reported to the caller.
        let reader = api.log_stream(pod, &lp).await?;
        let ctx = format!("{namespace}/{pod}");
        info!(pod = %ctx, container = ?lp.container, follow = lp.follow, tail = ?lp.tail_lines, "logs stream starting");
        tokio::spawn(async move {
            use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};
            let stream = ReaderStream::new(reader.compat());
            pump_bytes_to_lines(stream, tx, cancel_rx, Some(&ctx)).await;
        });

        Ok(StreamHandle { rx, cancel })
    }

    async fn exec(&self, namespace: &str, pod: &str, req: ExecRequest, mut io: ExecIo) -> Result<()> {
        use futures::SinkExt;
        use k8s_openapi::api::core::v1::Pod;
        use tokio::io::AsyncWriteExt;

        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut ap = if req.tty { AttachParams::interactive_tty() } else { AttachParams::default().stdout(true).stderr(true) };
        if let Some(c) = req.container.as_deref() {
            ap = ap.container(c);
        }
        ap = ap.stdin(io.stdin.is_some());

        let mut attached = api.exec(pod, req.command.clone(), &ap).await?;
        let status = attached.take_status();

        let mut resize_task = None;
        if let (Some(mut sizes), Some(mut tx)) = (io.resize.take(), attached.terminal_size()) {
            resize_task = Some(tokio::spawn(async move {
                while let Some((width, height)) = sizes.recv().await {
                    if tx.send(TerminalSize { width, height }).await.is_err() {
                        break;
                    }
                }
            }));
        }

        let mut stdin_task = None;
        if let (Some(mut input), Some(mut writer)) = (io.stdin.take(), attached.stdin()) {
            stdin_task = Some(tokio::spawn(async move {
                while let Some(chunk) = input.recv().await {
                    if writer.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
            }));
        }

        let out_task = attached.stdout().zip(io.stdout.take()).map(|(reader, sink)| tokio::spawn(forward_bytes(reader, sink)));
        let err_task = attached.stderr().zip(io.stderr.take()).map(|(reader, sink)| tokio::spawn(forward_bytes(reader, sink)));

        if let Err(e) = attached.join().await {
            warn!(pod = %pod, error = %e, "exec session ended abnormally");
        }
        if let Some(t) = stdin_task {
            t.abort();
        }
        if let Some(t) = resize_task {
            t.abort();
        }
        for t in [out_task, err_task].into_iter().flatten() {
            let _ = t.await;
        }

        if let Some(status) = status {
            if let Some(s) = status.await {
                if s.status.as_deref() == Some("Failure") {
                    return Err(anyhow!("exec in {}/{} failed: {}", namespace, pod, s.message.unwrap_or_default()));
                }
            }
        }
        Ok(())
    }

    async fn pod_metrics(&self, namespace: &str, label_selector: &str) -> Result<Vec<PodUsage>> {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        let ar = ApiResource::from_gvk_with_plural(&gvk, "pods");
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let list = api.list(&ListParams::default().labels(label_selector)).await?;
        Ok(list.items.iter().map(|o| pod_usage_from_metrics(namespace, o)).collect())
    }
}

async fn forward_bytes<R>(reader: R, sink: mpsc::Sender<Bytes>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut stream = tokio_util::io::ReaderStream::new(reader);
    while let Some(Ok(bytes)) = stream.next().await {
        if sink.send(bytes).await.is_err() {
            break;
        }
    }
}

fn pod_usage_from_metrics(namespace: &str, obj: &DynamicObject) -> PodUsage {
    let containers = obj.data.get("containers").and_then(|c| c.as_array()).map(Vec::as_slice).unwrap_or_default();
    PodUsage {
        namespace: namespace.to_string(),
        name: obj.metadata.name.clone().unwrap_or_default(),
        containers: containers
            .iter()
            .map(|c| {
                let usage = |key: &str| c.get("usage").and_then(|u| u.get(key)).and_then(|v| v.as_str());
                ContainerUsage {
                    name: c.get("name").and_then(|n| n.as_str()).unwrap_or_default().to_string(),
                    cpu_nano_cores: usage("cpu").and_then(parse_cpu_nanos).unwrap_or(0),
                    memory_bytes: usage("memory").and_then(parse_memory_bytes).unwrap_or(0),
                }
            })
            .collect(),
    }
}

/// CPU quantity (`250m`, `12345n`, `1.5`) in nanocores.
pub fn parse_cpu_nanos(q: &str) -> Option<u64> {
    let q = q.trim();
    let (num, scale) = match q.char_indices().last()? {
        (i, 'n') => (&q[..i], 1.0),
        (i, 'u') => (&q[..i], 1e3),
        (i, 'm') => (&q[..i], 1e6),
        _ => (q, 1e9),
    };
    let v: f64 = num.parse().ok()?;
    (v >= 0.0).then(|| (v * scale).round() as u64)
}

/// Memory quantity (`128Mi`, `1G`, `1048576`) in bytes.
pub fn parse_memory_bytes(q: &str) -> Option<u64> {
    const SUFFIXES: [(&str, f64); 10] = [
        ("Ki", 1024.0),
        ("Mi", 1048576.0),
        ("Gi", 1073741824.0),
        ("Ti", 1099511627776.0),
        ("k", 1e3),
        ("K", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("m", 1e-3),
    ];
    let q = q.trim();
    let (num, scale) = SUFFIXES.iter().find_map(|(s, f)| q.strip_suffix(s).map(|n| (n, *f))).unwrap_or((q, 1.0));
    let v: f64 = num.parse().ok()?;
    (v >= 0.0).then(|| (v * scale).round() as u64)
}

/// Internal: consume a stream of bytes, split into lines, send via bounded channel.
/// Drops lines when channel is full. Flushes last partial line on end.
async fn pump_bytes_to_lines<S, E>(stream: S, tx: mpsc::Sender<LogChunk>, mut cancel_rx: oneshot::Receiver<()>, ctx: Option<&str>)
where
    S: futures::Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = bytes::BytesMut::new();
    let ctx = ctx.unwrap_or("-");
    loop {
        tokio::select! {
            _ = &mut cancel_rx => { info!(ctx = %ctx, "log pump cancelled"); break; }
            next = stream.next() => {
                match next {
                    Some(Ok(chunk)) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line = buf.split_to(pos);
                            let _ = buf.split_to(1);
                            if let Ok(s) = std::str::from_utf8(&line) {
                                let _ = tx.try_send(LogChunk { line: s.to_string() });
                            }
                        }
                    }
                    Some(Err(e)) => { warn!(ctx = %ctx, error = %e, "log stream error"); break; }
                    None => break,
                }
            }
        }
    }
    if !buf.is_empty() {
        if let Ok(s) = std::str::from_utf8(&buf) {
            let _ = tx.try_send(LogChunk { line: s.to_string() });
        }
    }
    info!(ctx = %ctx, "log pump ended");
}
