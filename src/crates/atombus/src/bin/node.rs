//! atombus node: joins the bus and provides one or more services.

use std::path::PathBuf;
use std::sync::Arc;

use atombus::{build_processors, NodeConfig, PortRange, Service};
use atomspace::{AtomStore, AttentionBroker, InMemoryAtomStore, NullAttentionBroker};
use clap::Parser;
use service_bus::{PortPool, ServiceBus, ServiceBusConfig};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "atombus-node")]
#[command(about = "atombus service node", long_about = None)]
struct Args {
    /// Service to provide on the bus.
    #[arg(long)]
    service: Service,

    /// This node's bus id, host:port.
    #[arg(long)]
    hostname: Option<String>,

    /// Inclusive endpoint port range for command proxies, lo:hi.
    #[arg(long, value_name = "LO:HI")]
    ports_range: Option<PortRange>,

    /// Attention broker RPC address, host:port.
    #[arg(long)]
    attention_broker_address: Option<String>,

    /// Known bus peer to join through; omit to start a new bus.
    #[arg(long)]
    peer_address: Option<String>,

    /// Config file with defaults for the options above.
    #[arg(long, default_value = "atombus.toml")]
    config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    std::process::exit(match run().await {
        Ok(()) => 0,
        Err(error) => {
            error!(%error, "node startup failed");
            1
        }
    });
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = NodeConfig::load_optional(&args.config)?;

    let log_level = if args.verbose {
        "debug".to_string()
    } else {
        config.log_level.clone().unwrap_or_else(|| "info".to_string())
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let hostname = args
        .hostname
        .or(config.hostname)
        .ok_or_else(|| anyhow::anyhow!("--hostname (or config hostname) is required"))?;
    let ports_range = args
        .ports_range
        .or(config.ports_range)
        .ok_or_else(|| anyhow::anyhow!("--ports-range (or config ports_range) is required"))?;
    let peer_address = args.peer_address.or(config.peer_address);
    let cache_dir = PathBuf::from(config.cache_dir.unwrap_or_else(|| ".".to_string()));

    info!(%hostname, ?ports_range, service = ?args.service, "starting atombus node");

    let port_pool = PortPool::new(ports_range.lo, ports_range.hi)?;
    let bus = ServiceBus::start(
        ServiceBusConfig::new(hostname.clone(), peer_address),
        port_pool,
    )
    .await?;

    let store: Arc<dyn AtomStore> = Arc::new(InMemoryAtomStore::new());
    let attention: Arc<dyn AttentionBroker> = Arc::new(NullAttentionBroker);
    if let Some(address) = args.attention_broker_address.or(config.attention_broker_address) {
        // The RPC client lives behind the AttentionBroker trait; this
        // build carries the no-op implementation.
        warn!(%address, "attention broker address configured but no RPC client is built in");
    }

    for processor in build_processors(args.service, &bus, &store, &attention, &cache_dir) {
        bus.register_processor(processor).await?;
    }
    info!("node ready");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    bus.graceful_shutdown().await;
    Ok(())
}
