mod host;

use anyhow::Result;
use clap::Parser;
use fleet_cluster::{ClusterConfig, ClusterContext, NodeAddress, TcpTransport};
use host::LoggingServiceHost;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fleet-node")]
#[command(about = "Fleet cluster node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "fleet.toml")]
    config: String,

    /// Override the address this node is known by (host:port)
    #[arg(long, env = "FLEET_SELF_ADDRESS")]
    self_address: Option<NodeAddress>,

    /// Make this node the topology leader
    #[arg(long)]
    leader: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "FLEET_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Time a started shard takes to report ready, in milliseconds
    #[arg(long, default_value = "0")]
    shard_warmup_ms: u64,

    /// Maximum time to wait for the node to terminate, in seconds
    #[arg(long, default_value = "3600")]
    terminate_timeout_secs: u64,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,fleet_cluster=debug".into()),
    );
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let mut config = ClusterConfig::load(&args.config)?;
    if let Some(address) = args.self_address {
        config.self_address = address;
    }
    if args.leader {
        config.is_leader = true;
    }
    config.validate()?;

    tracing::info!(
        "Starting fleet node {} (leader: {})",
        config.self_address,
        config.is_leader
    );
    tracing::info!("Config file: {}", args.config);

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    }

    let (transport, events) =
        TcpTransport::bind(config.self_address.clone(), config.bind_addr()).await?;
    let host = Arc::new(LoggingServiceHost::new(Duration::from_millis(
        args.shard_warmup_ms,
    )));

    let mut context = ClusterContext::new(&config, Arc::new(transport.clone()), events, host);
    context.start()?;

    let coordinator = context.coordinator().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down node");
            if let Err(e) = coordinator.request_node_shutdown() {
                tracing::warn!("Failed to request shutdown: {}", e);
            }
        }
    });

    let terminated = context
        .wait_for_terminated(Duration::from_secs(args.terminate_timeout_secs))
        .await;
    let fault = context.fault();
    let coordinated = context.coordinator().is_coordinated_shutdown();

    context.shutdown().await;
    transport.shutdown();
    terminated?;

    if let Some(fault) = fault {
        tracing::error!("Node terminated: {}", fault);
        std::process::exit(fault.exit_code());
    }

    tracing::info!(coordinated, "Node terminated");
    Ok(())
}
