use clap::{Parser, Subcommand};
use rand::random;
use std::net::SocketAddr;
use tokio::signal;
use tracing::{error, info};

use ikev2_daemon::network::ike::session::{initiate, IKEDaemon};
use ikev2_daemon::DaemonConfig;

#[derive(Parser)]
#[command(name = "ikev2d")]
#[command(about = "IKEv2 daemon - IKE_SA_INIT handshake engine")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the IKE daemon
    Start {
        /// UDP port to listen on, overriding the configured one
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run an IKE_SA_INIT handshake against a peer
    Initiate {
        /// Peer address, e.g. 192.0.2.1:500
        peer: SocketAddr,
    },
    /// Write the active configuration to a file
    DumpConfig {
        /// Target path
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = match cli.log_level.as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config = DaemonConfig::load()?;
    info!("IKEv2 Daemon v0.1.0");

    match cli.command {
        Commands::Start { port } => {
            let port = port.unwrap_or(config.daemon.listen_port);
            let listen_addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
            let run_id: u32 = random();
            info!("Starting IKE daemon (run {:08x})", run_id);

            let mut daemon = IKEDaemon::new(listen_addr, config);
            daemon.start().await?;

            signal::ctrl_c().await?;
            info!("Shutting down");
        }
        Commands::Initiate { peer } => {
            info!("Initiating IKE_SA_INIT with {}", peer);
            match initiate(peer, &config).await {
                Ok(sa) => {
                    info!(
                        "Handshake complete, SPIs {:016x}_i {:016x}_r",
                        sa.id().initiator_spi,
                        sa.id().responder_spi
                    );
                }
                Err(e) => {
                    error!("Handshake failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::DumpConfig { path } => {
            config.save(&path)?;
            info!("Wrote configuration to {}", path);
        }
    }

    Ok(())
}
