//! BTC Mesh client.
//!
//! Splits a raw transaction into mesh-sized chunks, drives one send session
//! against a relay node, and reports the terminal result on stdout with a
//! distinct exit code per failure class.

use anyhow::Result;
use btcmesh_core::chunk::{self, DEFAULT_CHUNK_SIZE};
use btcmesh_core::sender::{SendError, SenderConfig, TxSender};
use btcmesh_core::transport::{BridgeTransport, NodeId};
use clap::Parser;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

/// Exit code for local validation failures.
const EXIT_VALIDATION: i32 = 2;
/// Exit code for timeouts and retry exhaustion.
const EXIT_TIMEOUT: i32 = 3;
/// Exit code when the relay answered with a terminal NACK.
const EXIT_PEER_NACK: i32 = 4;
/// Exit code for local transport failures.
const EXIT_TRANSPORT: i32 = 5;
/// Exit code for a cancelled send.
const EXIT_ABORTED: i32 = 6;

/// Send a raw Bitcoin transaction via a LoRa mesh relay
#[derive(Parser)]
#[command(name = "btcmesh-cli")]
#[command(author, version, about)]
struct Args {
    /// Destination relay node id (e.g. !abcdef12)
    #[arg(short, long)]
    destination: String,

    /// Raw transaction hex string
    #[arg(short, long)]
    tx: String,

    /// Validate and print the chunk plan without sending
    #[arg(long)]
    dry_run: bool,

    /// Mesh device bridge address (host:port of the radio bridge)
    #[arg(long, default_value = "127.0.0.1:4403")]
    device: String,

    /// Local node id reported by the radio, for logging
    #[arg(long, default_value = "!00000000")]
    node_id: String,

    /// Payload characters per chunk
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Seconds to wait for each per-chunk acknowledgement
    #[arg(long, default_value_t = 30)]
    ack_timeout: u64,

    /// Seconds to wait for the terminal result after the last chunk
    #[arg(long, default_value_t = 300)]
    terminal_timeout: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let destination = match NodeId::parse(&args.destination) {
        Ok(destination) => destination,
        Err(e) => {
            eprintln!("Invalid destination node id '{}': {e}", args.destination);
            std::process::exit(EXIT_VALIDATION);
        }
    };

    if args.dry_run {
        return dry_run(&args, &destination);
    }

    let local = match NodeId::parse(&args.node_id) {
        Ok(local) => local,
        Err(e) => {
            eprintln!("Invalid local node id '{}': {e}", args.node_id);
            std::process::exit(EXIT_VALIDATION);
        }
    };

    let (transport, mut inbound) = match BridgeTransport::connect(&args.device, local).await {
        Ok(connected) => connected,
        Err(e) => {
            eprintln!("Cannot reach mesh bridge at {}: {e}", args.device);
            std::process::exit(EXIT_TRANSPORT);
        }
    };

    let sender = TxSender::new(
        transport,
        SenderConfig {
            chunk_size: args.chunk_size,
            ack_timeout: Duration::from_secs(args.ack_timeout),
            terminal_timeout: Duration::from_secs(args.terminal_timeout),
            ..SenderConfig::default()
        },
    );

    let (cancel_tx, cancel_rx) = oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(());
        }
    });

    match sender.send(&args.tx, &destination, &mut inbound, cancel_rx).await {
        Ok(txid) => {
            println!("Broadcast succeeded. TXID: {txid}");
            Ok(())
        }
        Err(e) => {
            eprintln!("Send failed: {e}");
            std::process::exit(exit_code(&e));
        }
    }
}

fn dry_run(args: &Args, destination: &NodeId) -> Result<()> {
    match chunk::split_transaction(&args.tx, args.chunk_size) {
        Ok(fragments) => {
            println!(
                "Dry run: {} chars of hex split into {} chunk(s) of up to {} chars for {}",
                args.tx.len(),
                fragments.len(),
                args.chunk_size,
                destination
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Invalid raw transaction hex: {e}");
            std::process::exit(EXIT_VALIDATION);
        }
    }
}

fn exit_code(error: &SendError) -> i32 {
    match error {
        SendError::Validation(_) => EXIT_VALIDATION,
        SendError::Timeout | SendError::RetryExhausted => EXIT_TIMEOUT,
        SendError::PeerNack(_) => EXIT_PEER_NACK,
        SendError::Transport(_) => EXIT_TRANSPORT,
        SendError::Aborted => EXIT_ABORTED,
    }
}
