//! atombus client: issues bus commands and iterates their answers.

use std::sync::Arc;
use std::time::Duration;

use atombus::PortRange;
use clap::{Parser, Subcommand};
use query_engine::PatternMatchingQueryProxy;
use service_bus::{CommandProxy, PortPool, ServiceBus, ServiceBusConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "atombus-client")]
#[command(about = "atombus command-line client", long_about = None)]
struct Args {
    /// This client's bus id, host:port.
    #[arg(long)]
    hostname: String,

    /// Inclusive endpoint port range for command proxies, lo:hi.
    #[arg(long, value_name = "LO:HI")]
    ports_range: PortRange,

    /// Bus node providing the requested service, host:port.
    #[arg(long)]
    service_hostname: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue a pattern matching query and print its answers.
    Query {
        /// Whitespace-separated query tokens.
        #[arg(required = true)]
        request: Vec<String>,

        /// Attention context the query runs under.
        #[arg(long, default_value = "")]
        context: String,

        /// Stop after this many answers (0 = unlimited).
        #[arg(long, default_value_t = 0)]
        max_answers: i64,

        /// Ask only for the total number of answers.
        #[arg(long)]
        count: bool,

        /// Suppress duplicate variable assignments.
        #[arg(long)]
        unique_assignment: bool,

        /// Update the attention broker with the query's answers.
        #[arg(long)]
        update_attention: bool,
    },
}

#[tokio::main]
async fn main() {
    std::process::exit(match run().await {
        Ok(()) => 0,
        Err(error) => {
            error!(%error, "client failed");
            1
        }
    });
}

async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let port_pool = PortPool::new(args.ports_range.lo, args.ports_range.hi)?;
    let bus = ServiceBus::start(
        ServiceBusConfig::new(args.hostname.clone(), Some(args.service_hostname.clone())),
        port_pool,
    )
    .await?;

    // Ownership arrives from the hub right after joining.
    for _ in 0..200 {
        if bus
            .owner_of(service_bus::commands::PATTERN_MATCHING_QUERY)
            .is_some()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    match args.command {
        Command::Query {
            request,
            context,
            max_answers,
            count,
            unique_assignment,
            update_attention,
        } => {
            let proxy = PatternMatchingQueryProxy::new(request, context);
            proxy.set_count_flag(count);
            proxy.set_unique_assignment_flag(unique_assignment);
            proxy.set_attention_update_flag(update_attention);
            if max_answers > 0 {
                proxy.set_max_answers(max_answers);
            }
            bus.issue_bus_command(proxy.clone() as Arc<dyn CommandProxy>)
                .await?;

            while !proxy.finished() {
                if count {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    continue;
                }
                match proxy.pop()? {
                    Some(answer) => println!("{}", answer),
                    None => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            }
            if count {
                println!("{}", proxy.get_count());
            } else {
                info!(total = proxy.get_count(), "query finished");
            }
            if let Some((code, message)) = proxy.core().error() {
                anyhow::bail!("query failed with code {}: {}", code, message);
            }
        }
    }
    bus.graceful_shutdown().await;
    Ok(())
}
