//! tapsock CLI
//!
//! Joins a virtual network over a UDP bridge and runs socket demos on it.

mod bridge;
mod config;
mod demo;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tapsock_core::AddressFamily;
use tapsock_stack::{IpCidr, NetworkService};
use tracing_subscriber::EnvFilter;

use bridge::Bridge;
use config::Config;

/// tapsock - POSIX-style sockets over a virtual network
#[derive(Parser)]
#[command(name = "tapsock")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the bridge listen address
    #[arg(long)]
    bridge: Option<String>,

    /// Add a bridge peer (repeatable)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Add a Tap address, e.g. 10.147.17.5/24 (repeatable)
    #[arg(long = "address")]
    addresses: Vec<IpCidr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Echo every stream connection
    EchoServer {
        /// Port to listen on
        #[arg(short, long, default_value_t = 7)]
        port: u16,

        /// Listen on IPv6
        #[arg(long)]
        ipv6: bool,
    },

    /// Send a message to an echo server and print the reply
    Client {
        /// Server address
        #[arg(required = true)]
        target: SocketAddr,

        /// Message to send
        #[arg(short, long, default_value = "hello")]
        message: String,

        /// Seconds to wait for the reply
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },

    /// Datagram ping, or a responder when no target is given
    Datagram {
        /// Responder address
        target: Option<SocketAddr>,

        /// Responder port
        #[arg(short, long, default_value_t = 7)]
        port: u16,

        /// Message to send
        #[arg(short, long, default_value = "ping")]
        message: String,

        /// Seconds to wait for the reply
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },

    /// Show the effective configuration
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(listen) = &cli.bridge {
        config.bridge.listen = listen.clone();
    }
    config.bridge.peers.extend(cli.peers.iter().cloned());
    config.tap.addresses.extend(cli.addresses.iter().copied());

    // Initialize logging
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    if let Commands::Status = cli.command {
        show_status(&config);
        return Ok(());
    }

    // Validate configuration
    config.validate()?;

    let service = Arc::new(NetworkService::new(config.stack.clone()));
    let bridge = Bridge::bind(&config.bridge)?;
    let tap = service.attach_tap(config.tap.to_tap_config(), bridge.sink())?;
    println!(
        "Joined network {} as {} via bridge {}",
        tap.network(),
        tap.mac(),
        bridge.local_addr()?
    );
    let bridge_task = tokio::spawn(bridge.run(Arc::clone(&service)));

    // Demos block on socket calls; a detached thread does not hold up shutdown
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let demo_service = Arc::clone(&service);
    std::thread::Builder::new()
        .name("demo".to_string())
        .spawn(move || {
            let _ = done_tx.send(run_demo(demo_service, cli.command));
        })?;

    tokio::select! {
        finished = done_rx => finished??,
        bridged = bridge_task => bridged??,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            println!("\nShutting down...");
        }
    }

    let stats = tap.stats();
    tracing::info!(
        "tap {}: {} frames in, {} out, {} dropped",
        tap.network(),
        stats.frames_in,
        stats.frames_out,
        stats.frames_dropped
    );
    service.detach_tap(tap.network());
    Ok(())
}

fn run_demo(service: Arc<NetworkService>, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::EchoServer { port, ipv6 } => {
            let family = if ipv6 {
                AddressFamily::Inet6
            } else {
                AddressFamily::Inet
            };
            demo::echo_server(service, family, port)
        }
        Commands::Client {
            target,
            message,
            timeout,
        } => demo::client(&service, target, &message, Duration::from_secs(timeout)),
        Commands::Datagram {
            target: Some(target),
            message,
            timeout,
            ..
        } => demo::datagram_ping(&service, target, &message, Duration::from_secs(timeout)),
        Commands::Datagram {
            target: None, port, ..
        } => demo::datagram_responder(&service, AddressFamily::Inet, port),
        Commands::Status => Ok(()),
    }
}

fn show_status(config: &Config) {
    println!("tapsock");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("Tap:");
    println!("  Network: {}", config.tap.network);
    match config.tap.mac {
        Some(mac) => println!("  MAC: {}", mac),
        None => println!("  MAC: derived at start"),
    }
    println!("  MTU: {}", config.tap.mtu);
    for cidr in &config.tap.addresses {
        println!("  Address: {}", cidr);
    }
    for route in &config.tap.routes {
        println!("  Route: {}", route);
    }
    println!();

    println!("Bridge:");
    println!("  Listen: {}", config.bridge.listen);
    println!("  Peers: {}", config.bridge.peers.len());
    println!();

    println!("Stack:");
    println!("  Max sockets: {}", config.stack.max_sockets);
    println!("  RX/TX ring: {} / {} bytes", config.stack.rx_buffer_size, config.stack.tx_buffer_size);
    println!("  Default backlog: {}", config.stack.default_backlog);
    println!("  Write mode: {:?}", config.stack.write_mode);
}
