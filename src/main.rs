use anyhow::{Context, Result};
use chunkvault::{Coordinator, CoordinatorConfig, NodeConfig, NodeMode, StorageNode};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = Command::new("Chunkvault")
        .version("0.1.0")
        .about("Chunked, replicated blob storage: one coordinator, many storage nodes")
        .subcommand_required(true)
        .subcommand(
            Command::new("coordinator")
                .about("Run the coordinator (HTTP API plus node listener)")
                .arg(
                    Arg::new("host")
                        .long("host")
                        .help("Address to bind both listeners to")
                        .value_parser(value_parser!(IpAddr))
                        .default_value("0.0.0.0"),
                )
                .arg(
                    Arg::new("api-port")
                        .long("api-port")
                        .help("HTTP API port")
                        .value_parser(value_parser!(u16))
                        .default_value("5000"),
                )
                .arg(
                    Arg::new("node-port")
                        .long("node-port")
                        .help("Port storage nodes dial to register")
                        .value_parser(value_parser!(u16))
                        .default_value("6000"),
                )
                .arg(
                    Arg::new("replication-factor")
                        .long("replication-factor")
                        .help("Nodes each chunk is pushed to")
                        .value_parser(value_parser!(usize))
                        .default_value("2"),
                )
                .arg(
                    Arg::new("snapshot")
                        .long("snapshot")
                        .help("Metadata snapshot file")
                        .value_parser(value_parser!(PathBuf))
                        .default_value("system_data.json"),
                )
                .arg(
                    Arg::new("io-timeout-ms")
                        .long("io-timeout-ms")
                        .help("Deadline for one exchange with a node")
                        .value_parser(value_parser!(u64))
                        .default_value("30000"),
                )
                .arg(
                    Arg::new("enforce-quota")
                        .long("enforce-quota")
                        .help("Reject new files that would exceed the owner's quota")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("node")
                .about("Run a storage node")
                .arg(
                    Arg::new("storage")
                        .long("storage")
                        .help("Directory chunks are kept in")
                        .value_parser(value_parser!(PathBuf))
                        .default_value("node_storage"),
                )
                .arg(
                    Arg::new("coordinator")
                        .long("coordinator")
                        .help("Coordinator node address to dial")
                        .default_value("127.0.0.1:6000"),
                )
                .arg(
                    Arg::new("listen")
                        .long("listen")
                        .help("Wait on this port for the coordinator to dial in instead")
                        .value_parser(value_parser!(u16)),
                )
                .arg(
                    Arg::new("node-id")
                        .long("node-id")
                        .help("Node id (default: generated once and kept in the storage directory)"),
                )
                .arg(
                    Arg::new("capacity")
                        .long("capacity")
                        .help("Capacity in bytes advertised to the coordinator")
                        .value_parser(value_parser!(u64)),
                ),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("coordinator", args)) => run_coordinator(args).await,
        Some(("node", args)) => run_node(args).await,
        _ => anyhow::bail!("expected the coordinator or node subcommand"),
    }
}

fn arg<T: Clone + Send + Sync + 'static>(matches: &ArgMatches, name: &str) -> Result<T> {
    matches
        .get_one::<T>(name)
        .cloned()
        .with_context(|| format!("missing --{}", name))
}

async fn run_coordinator(args: &ArgMatches) -> Result<()> {
    let mut config = CoordinatorConfig::new(arg(args, "host")?);
    config.api_port = arg(args, "api-port")?;
    config.node_port = arg(args, "node-port")?;
    config.replication_factor = arg(args, "replication-factor")?;
    config.snapshot_path = arg(args, "snapshot")?;
    config.io_timeout_ms = arg(args, "io-timeout-ms")?;
    config.enforce_quota = args.get_flag("enforce-quota");

    if config.replication_factor == 0 {
        anyhow::bail!("--replication-factor must be at least 1");
    }

    info!("Coordinator configuration: {:?}", config);

    let coordinator = Coordinator::new(config)
        .await
        .context("failed to start coordinator")?;
    coordinator.start().await?;
    Ok(())
}

async fn run_node(args: &ArgMatches) -> Result<()> {
    let mode = match args.get_one::<u16>("listen") {
        Some(port) => NodeMode::Listen { port: *port },
        None => NodeMode::Dial {
            coordinator: arg(args, "coordinator")?,
        },
    };

    let mut config = NodeConfig::new(arg::<PathBuf>(args, "storage")?, mode);
    config.node_id = args.get_one::<String>("node-id").cloned();
    if let Some(capacity) = args.get_one::<u64>("capacity") {
        config.capacity = *capacity;
    }

    info!("Node configuration: {:?}", config);

    let node = StorageNode::new(config)
        .await
        .context("failed to open storage node")?;
    node.start().await?;
    Ok(())
}
