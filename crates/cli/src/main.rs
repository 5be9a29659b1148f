//! Fleetsweep: garbage collector for game-server fleets and autoscalers.

#![forbid(unsafe_code)]

mod collector;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser};
use fleetsweep_core::{GcConfig, ResourceKind};
use fleetsweep_kube::KubeHub;
use fleetsweep_runtime::Builder;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use collector::LabelCollector;

const FLEET_KIND: &str = "agones.dev/v1/Fleet";
const FLEET_AUTOSCALER_KIND: &str = "autoscaling.agones.dev/v1/FleetAutoscaler";

#[derive(Parser, Debug)]
#[command(name = "fleetsweep", version, about = "Garbage collector for game-server fleets")]
struct Cli {
    /// Debug mode.
    #[arg(long, action = ArgAction::SetTrue)]
    debug: bool,

    /// Path for the kubeconfig file. Only required for development.
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<String>,

    /// Sync period interval, in seconds.
    #[arg(long = "sync-period-secs", default_value_t = 15)]
    sync_period_secs: u64,

    /// Maximum number of concurrent reconciles which can be run.
    #[arg(long = "max-concurrent", default_value_t = 5)]
    max_concurrent: usize,

    /// Namespace to watch (default: all namespaces).
    #[arg(long = "ns")]
    namespace: Option<String>,

    /// Prometheus exporter listen address.
    #[arg(long = "metrics-addr", default_value = "0.0.0.0:8095")]
    metrics_addr: String,
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let env = std::env::var("FLEETSWEEP_LOG").unwrap_or_else(|_| default.to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: &str) {
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        }
        Err(_) => warn!(addr = %addr, "invalid metrics addr; expected host:port"),
    }
}

fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let term = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!(error = %e, "cannot listen for ctrl-c");
                }
            }
            _ = term => {}
        }
        info!("termination signal received; shutting down");
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    init_metrics(&cli.metrics_addr);
    info!(version = env!("CARGO_PKG_VERSION"), "fleetsweep starting");

    let hub = Arc::new(KubeHub::connect(cli.kubeconfig.as_deref(), cli.namespace.clone()).await?);
    let gc: Arc<LabelCollector> = Arc::new(LabelCollector::new(Arc::clone(&hub)));

    let config = GcConfig::new(Duration::from_secs(cli.sync_period_secs), cli.max_concurrent);
    let controller = Builder::new(config)
        .lister(Arc::clone(&hub) as _)
        .register(ResourceKind::new(FLEET_KIND), Arc::clone(&hub) as _, Arc::clone(&gc) as _)
        .register(ResourceKind::new(FLEET_AUTOSCALER_KIND), Arc::clone(&hub) as _, gc)
        .build()?;

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone());

    controller.start(token).await
}
