//! kubemux - multi-cluster Kubernetes resource stream server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kubemux::api::{
    start_server, AppState, HandlerConfig, MetricsRecorder, ServerConfig, StreamHandler,
};
use kubemux::auth::PermissionCacheConfig;
use kubemux::clusters::{connect_clusters, read_kubeconfig, select_contexts};
use kubemux::common::telemetry::{init_telemetry, TelemetryConfig};
use kubemux::common::DEFAULT_LISTEN_ADDR;
use kubemux::stream::{ClusterAdapter, ClusterConfig, ClusterRegistry, ResourceCatalog, StreamConfig};

/// kubemux - stream Kubernetes resources from many clusters over one connection
#[derive(Parser, Debug)]
#[command(name = "kubemux", version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "KUBEMUX_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    addr: SocketAddr,

    /// Kubeconfig path; defaults to `KUBECONFIG` / `~/.kube/config`
    #[arg(long, env = "KUBEMUX_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Contexts to connect, comma separated; every context when empty
    #[arg(long, env = "KUBEMUX_CONTEXTS", value_delimiter = ',')]
    contexts: Vec<String>,

    /// Permission decision lifetime in seconds
    #[arg(long, env = "KUBEMUX_PERMISSION_TTL_SECS", default_value_t = 120)]
    permission_ttl_secs: u64,

    /// Updates retained per series for resume
    #[arg(long, env = "KUBEMUX_BACKLOG", default_value_t = 256)]
    backlog: usize,

    /// Allow subscribe without a cluster (broadcast to every cluster)
    #[arg(long, env = "KUBEMUX_ALLOW_BROADCAST")]
    allow_broadcast: bool,

    /// Send reset on unsatisfiable resume; `false` resubscribes silently
    #[arg(long, env = "KUBEMUX_SEND_RESET", default_value_t = true, action = ArgAction::Set)]
    send_reset: bool,

    /// Log JSON lines instead of human-readable output
    #[arg(long, env = "KUBEMUX_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            permissions: PermissionCacheConfig {
                default_ttl: Duration::from_secs(self.permission_ttl_secs),
                ..PermissionCacheConfig::default()
            },
            stream: StreamConfig {
                backlog_capacity: self.backlog,
                ..StreamConfig::default()
            },
            ..ClusterConfig::default()
        }
    }

    fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            allow_cluster_scoped_requests: self.allow_broadcast,
            send_reset: self.send_reset,
            ..HandlerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        json: cli.log_json,
        ..TelemetryConfig::default()
    })?;

    let kubeconfig = read_kubeconfig(cli.kubeconfig.as_deref())?;
    let contexts = select_contexts(&kubeconfig, &cli.contexts)?;

    let registry = Arc::new(ClusterRegistry::new());
    connect_clusters(&registry, &kubeconfig, &contexts, &cli.cluster_config()).await?;

    let adapter = Arc::new(ClusterAdapter::new(registry.clone(), ResourceCatalog::builtin()));
    let handler = StreamHandler::new(adapter, cli.handler_config())
        .with_recorder(Arc::new(MetricsRecorder::new()));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    let result = start_server(
        ServerConfig { addr: cli.addr },
        AppState::new(Arc::new(handler)),
        shutdown,
    )
    .await;

    registry.shutdown().await;
    result?;
    Ok(())
}
