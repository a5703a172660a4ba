//! BTC Mesh relay server.
//!
//! Long-lived process that reassembles chunked transactions arriving over
//! the mesh, broadcasts them through a Bitcoin Core RPC endpoint, and
//! answers each sender with a terminal ACK or NACK. Sessions live only in
//! memory; a restart forgets everything except the broadcast history file.

use anyhow::{Context, Result};
use btcmesh_core::config::{self, RpcConfig};
use btcmesh_core::history::BroadcastHistory;
use btcmesh_core::relay::{RelayConfig, RelayEngine};
use btcmesh_core::rpc::CoreRpcClient;
use btcmesh_core::transport::{BridgeTransport, NodeId};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// BTC Mesh relay - reassemble and broadcast transactions from the mesh
#[derive(Parser)]
#[command(name = "btcmesh-server")]
#[command(author, version, about)]
struct Args {
    /// Mesh device bridge address (host:port of the radio bridge)
    #[arg(long, default_value = "127.0.0.1:4403")]
    device: String,

    /// Local node id reported by the radio, for logging
    #[arg(long, default_value = "!00000000")]
    node_id: String,

    /// Bitcoin Core RPC host
    #[arg(long, env = "BITCOIN_RPC_HOST")]
    rpc_host: Option<String>,

    /// Bitcoin Core RPC port
    #[arg(long, env = "BITCOIN_RPC_PORT")]
    rpc_port: Option<u16>,

    /// Bitcoin Core RPC username
    #[arg(long, env = "BITCOIN_RPC_USER")]
    rpc_user: Option<String>,

    /// Bitcoin Core RPC password
    #[arg(long, env = "BITCOIN_RPC_PASSWORD")]
    rpc_password: Option<String>,

    /// Path to a Bitcoin Core .cookie file; overrides user/password
    #[arg(long, env = "BITCOIN_RPC_COOKIE")]
    rpc_cookie: Option<String>,

    /// Seconds before an incomplete reassembly session is discarded
    #[arg(long, env = "REASSEMBLY_TIMEOUT_SECONDS")]
    reassembly_timeout: Option<u64>,

    /// Broadcast history file
    #[arg(long, default_value = "~/.btcmesh/history.json")]
    history_file: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env first so clap's env fallbacks see it.
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("starting BTC mesh relay server");

    let rpc_config = RpcConfig::resolve(
        args.rpc_host,
        args.rpc_port,
        args.rpc_user,
        args.rpc_password,
        args.rpc_cookie.as_deref(),
    )
    .context("resolving RPC configuration")?;
    let rpc = Arc::new(CoreRpcClient::new(&rpc_config)?);
    let chain = rpc
        .check_connection()
        .await
        .context("probing Bitcoin Core RPC")?;
    info!(chain = %chain, url = %rpc_config.url(), "Bitcoin Core reachable");

    let local = NodeId::parse(&args.node_id).context("parsing --node-id")?;
    let (transport, inbound) = BridgeTransport::connect(&args.device, local)
        .await
        .context("connecting to the mesh bridge")?;
    info!(bridge = %args.device, "mesh bridge connected");

    let history_path = shellexpand::tilde(&args.history_file).into_owned();
    let history = Arc::new(BroadcastHistory::new(&history_path));

    let engine = RelayEngine::new(
        transport,
        rpc,
        RelayConfig {
            reassembly_timeout: config::reassembly_timeout(args.reassembly_timeout),
            janitor_interval: Duration::from_secs(1),
        },
    )
    .with_history(history);

    tokio::select! {
        _ = engine.run(inbound) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down on interrupt");
        }
    }

    Ok(())
}
