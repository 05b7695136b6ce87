use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use peerlink_core::PeeringConfig;
use peerlink_kubehub::{ClusterApi, KubeCluster};
use peerlink_ops::KubeOps;
use peerlink_provider::Provider;
use peerlink_reflect::{PeeringContext, Supervisor};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "peerlinkd", version, about = "Reflect workloads between a home and a foreign cluster")]
struct Cli {
    /// Kubeconfig of the home cluster (default: ambient config / in-cluster)
    #[arg(long, env = "PEERLINK_HOME_KUBECONFIG", global = true)]
    home_kubeconfig: Option<PathBuf>,

    /// Kubeconfig of the foreign cluster
    #[arg(long, env = "PEERLINK_FOREIGN_KUBECONFIG", global = true)]
    foreign_kubeconfig: Option<PathBuf>,

    #[arg(long, env = "PEERLINK_HOME_CLUSTER_ID", global = true)]
    home_cluster_id: Option<String>,

    #[arg(long, env = "PEERLINK_FOREIGN_CLUSTER_ID", global = true)]
    foreign_cluster_id: Option<String>,

    #[arg(long, env = "PEERLINK_VIRTUAL_NODE_PREFIX", global = true)]
    virtual_node_prefix: Option<String>,

    #[arg(long, env = "PEERLINK_VIRTUAL_NODE_NAME", global = true)]
    virtual_node_name: Option<String>,

    /// Kinds to reflect, e.g. "pods,services,endpoints"
    #[arg(long, env = "PEERLINK_REFLECT", global = true)]
    reflect: Option<String>,

    /// "foreign-to-home", "home-to-foreign" or both, comma separated
    #[arg(long, env = "PEERLINK_ENDPOINTS_DIRECTIONS", global = true)]
    endpoints_directions: Option<String>,

    #[arg(long, env = "PEERLINK_ENDPOINT_SLICES", global = true)]
    endpoint_slices: Option<String>,

    #[arg(long, env = "PEERLINK_QUEUE_CAP", global = true)]
    queue_cap: Option<String>,

    #[arg(long, env = "PEERLINK_WATCH_BACKOFF_MAX_SECS", global = true)]
    watch_backoff_max_secs: Option<String>,

    /// Pre-agreed namespace pairs, "home=foreign,..."
    #[arg(long, env = "PEERLINK_NAMESPACES", global = true)]
    namespaces: Option<String>,

    /// Seconds between dangling-pod sweeps; 0 disables them
    #[arg(long, env = "PEERLINK_SWEEP_INTERVAL_SECS", default_value_t = 300, global = true)]
    sweep_interval_secs: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the peering until interrupted (default)
    Run,
    /// Print the resolved peering configuration and exit
    Config {
        #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
        output: Output,
    },
}

impl Cli {
    /// Flag values keyed by their environment name, so flags and env share one parser.
    fn lookup(&self, key: &str) -> Option<String> {
        let v = match key {
            "PEERLINK_HOME_CLUSTER_ID" => &self.home_cluster_id,
            "PEERLINK_FOREIGN_CLUSTER_ID" => &self.foreign_cluster_id,
            "PEERLINK_VIRTUAL_NODE_PREFIX" => &self.virtual_node_prefix,
            "PEERLINK_VIRTUAL_NODE_NAME" => &self.virtual_node_name,
            "PEERLINK_REFLECT" => &self.reflect,
            "PEERLINK_ENDPOINTS_DIRECTIONS" => &self.endpoints_directions,
            "PEERLINK_ENDPOINT_SLICES" => &self.endpoint_slices,
            "PEERLINK_QUEUE_CAP" => &self.queue_cap,
            "PEERLINK_WATCH_BACKOFF_MAX_SECS" => &self.watch_backoff_max_secs,
            "PEERLINK_NAMESPACES" => &self.namespaces,
            _ => return None,
        };
        v.clone()
    }
}

fn init_tracing() {
    let env = std::env::var("PEERLINK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PEERLINK_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid PEERLINK_METRICS_ADDR; expected host:port");
        }
    }
}

async fn connect(name: &str, kubeconfig: Option<&Path>) -> Result<KubeCluster> {
    match kubeconfig {
        Some(path) => KubeCluster::from_kubeconfig(name, path).await,
        None => KubeCluster::try_default(name).await,
    }
}

async fn run(cli: &Cli, cfg: PeeringConfig, sweep_every: Duration) -> Result<()> {
    let home = connect("home", cli.home_kubeconfig.as_deref()).await?;
    let foreign = connect("foreign", cli.foreign_kubeconfig.as_deref()).await?;
    let ops = Arc::new(KubeOps::new(foreign.client()));
    let home: Arc<dyn ClusterApi> = Arc::new(home);
    let foreign: Arc<dyn ClusterApi> = Arc::new(foreign);

    let ctx = PeeringContext::new(cfg, home, foreign).context("seeding namespace mappings")?;
    let provider = Provider::new(ctx.clone(), ops);
    let sup = Supervisor::start(ctx);
    let cancel = sup.cancel_token();

    let sweeper = (!sweep_every.is_zero() && provider.context().cfg.reflects(peerlink_core::ResourceKind::Pod)).then(|| {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweep_every);
            // First tick fires immediately, before the caches have synced.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => match provider.sweep_dangling().await {
                        Ok(0) => {}
                        Ok(n) => info!(removed = n, "dangling sweep"),
                        Err(e) => warn!(error = %e, "dangling sweep failed"),
                    },
                }
            }
        })
    });

    tokio::select! {
        _ = signal::ctrl_c() => info!("Ctrl-C received; tearing peering down"),
        _ = cancel.cancelled() => warn!("peering cancelled"),
    }
    sup.shutdown();
    if let Some(h) = sweeper {
        let _ = h.await;
    }
    sup.wait().await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = PeeringConfig::from_lookup(|k| cli.lookup(k)).context("invalid peering configuration")?;

    match &cli.command {
        Some(Commands::Config { output }) => match output {
            Output::Json => println!("{}", serde_json::to_string_pretty(&cfg)?),
            Output::Human => {
                println!("home:      {}", cfg.home_cluster_id);
                println!("foreign:   {}", cfg.foreign_cluster_id);
                println!("node:      {}", cfg.virtual_node_name);
                let kinds: Vec<_> = cfg.reflected_kinds.iter().map(|k| k.as_str()).collect();
                println!("reflect:   {}", kinds.join(", "));
                println!("slices:    {}", cfg.endpoint_slices);
                for (h, f) in &cfg.static_namespaces {
                    println!("namespace: {} -> {}", h, f);
                }
            }
        },
        Some(Commands::Run) | None => run(&cli, cfg, Duration::from_secs(cli.sweep_interval_secs)).await?,
    }
    info!("peerlinkd exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_interval_applies_without_subcommand() {
        let cli = Cli::try_parse_from(["peerlinkd", "--sweep-interval-secs", "30"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.sweep_interval_secs, 30);
    }

    #[test]
    fn sweep_interval_is_global() {
        let cli = Cli::try_parse_from(["peerlinkd", "run", "--sweep-interval-secs", "0"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Run)));
        assert_eq!(cli.sweep_interval_secs, 0);
    }
}
