//! tcpgate - framed TCP server
//!
//! Runs the server core with a logging packet handler, or with a queue
//! consumer task in queue mode, until SIGTERM/SIGINT.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tcpgate::{
    Connection, DispatchMode, IncomingPacketQueue, PacketEnvelope, ServerBuilder,
    ServerCallbackHandler,
};

/// CLI arguments for tcpgate
#[derive(Parser, Debug)]
#[command(name = "tcpgate")]
#[command(about = "tcpgate - length-prefixed TCP server with admission control")]
#[command(version)]
#[command(long_about = "
tcpgate - length-prefixed TCP server with admission control

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  TCPGATE_PORT           - Listening port
  TCPGATE_WORKER_BOUND   - Maximum concurrent connection workers (0 = unbounded)
  TCPGATE_DISPATCH_MODE  - Packet dispatch mode (handler, queue)
  TCPGATE_SHUTDOWN_TIMEOUT - Graceful shutdown timeout (e.g., 30s, 1m)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "tcpgate.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Port to bind to (overrides config file)
    #[arg(short, long, help = "Port to bind to")]
    pub port: Option<u16>,

    /// Host address to bind to (overrides config file)
    #[arg(short, long, help = "Bind host (e.g., 127.0.0.1)")]
    pub bind: Option<IpAddr>,

    /// Maximum concurrent connection workers
    #[arg(short, long, help = "Maximum concurrent connection workers (0 = unbounded)")]
    pub workers: Option<usize>,

    /// Packet dispatch mode
    #[arg(short, long, help = "Packet dispatch mode (handler, queue)")]
    pub mode: Option<DispatchMode>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", help = "Log level")]
    pub log_level: String,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

/// Logs every packet it receives
fn log_packet(envelope: PacketEnvelope) {
    info!(
        "Received {} bytes from connection {}",
        envelope.payload.len(),
        envelope.connection_id
    );
}

/// Logs server lifecycle events
struct LoggingCallbacks;

impl ServerCallbackHandler for LoggingCallbacks {
    fn on_started(&self) {
        info!("Accept loop started");
    }

    fn on_new_connection(&self, connection: &Arc<Connection>) {
        info!("New connection {} from {}", connection.id(), connection.host());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    init_tracing(&args).context("Failed to initialize tracing")?;

    info!("Starting tcpgate v{}", env!("CARGO_PKG_VERSION"));

    let mut builder = ServerBuilder::new()
        .with_config_file(&args.config)
        .with_packet_handler(log_packet)
        .with_callback_handler(LoggingCallbacks);
    if let Some(port) = args.port {
        builder = builder.with_port(port);
    }
    if let Some(host) = args.bind {
        builder = builder.with_bind_host(host);
    }
    if let Some(workers) = args.workers {
        builder = builder.with_worker_bound(workers);
    }
    if let Some(mode) = args.mode {
        builder = builder.with_dispatch_mode(mode);
    }

    if args.validate_config {
        let config = builder
            .build_configuration()
            .context("Configuration validation failed")?;
        info!("Configuration is valid");
        info!("Configuration summary:");
        info!("  Bind address: {}", config.bind_addr());
        info!(
            "  Worker bound: {}",
            if config.is_bounded() {
                config.worker_bound().to_string()
            } else {
                "unbounded".to_string()
            }
        );
        info!("  Dispatch mode: {}", config.dispatch_mode());
        info!("  Max frame size: {} bytes", config.max_frame_size());
        return Ok(());
    }

    let server = builder.build().await.context("Failed to start server")?;

    let consumer = server.incoming_queue().map(|queue| {
        let queue = Arc::clone(queue);
        tokio::spawn(consume_queue(queue))
    });

    let server_handle = server.start();

    info!("tcpgate listening on {}", server.local_addr());
    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    if let Err(e) = server.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
    }

    info!("Initiating graceful shutdown...");
    let aborted = server.shutdown_and_wait().await;
    if aborted > 0 {
        warn!("{} connection workers did not finish in time", aborted);
    }

    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Accept loop failed: {}", e),
        Err(e) if !e.is_cancelled() => error!("Server task failed: {}", e),
        Err(_) => {}
    }

    if let Some(handle) = consumer {
        handle.abort();
    }

    let stats = server.stats();
    info!(
        "Server shutdown complete ({} accepted, {} rejected)",
        stats.connections_accepted, stats.connections_rejected
    );

    Ok(())
}

/// Drain the incoming packet queue until aborted
async fn consume_queue(queue: Arc<IncomingPacketQueue>) {
    loop {
        let envelope = queue.pop().await;
        log_packet(envelope);
    }
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
