//! netframe server binary.
//!
//! # Usage
//!
//! ```bash
//! netframe-server --bind 0.0.0.0:4433
//! ```

use std::time::Duration;

use clap::Parser;
use netframe_proto::HeaderLayout;
use netframe_server::{ServerConfig, codec_from_config};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// netframe packet dispatch server
#[derive(Parser, Debug)]
#[command(name = "netframe-server")]
#[command(about = "netframe TCP packet dispatch server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:4433")]
    bind: String,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: u32,

    /// Maximum concurrent connections from a single IP
    #[arg(long, default_value = "64")]
    max_per_ip_connections: u32,

    /// Default per-handler timeout, in milliseconds
    #[arg(long, default_value = "5000")]
    handler_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("netframe server starting");
    tracing::info!("binding to {}", args.bind);

    let bind_address = args.bind.parse()?;

    let mut config = ServerConfig::default();
    config.network.max_connections = args.max_connections;
    config.network.max_per_ip_connections = args.max_per_ip_connections;
    config.dispatcher.default_timeout = Duration::from_millis(args.handler_timeout_ms);

    let codec = codec_from_config(&config.dispatcher);
    let dispatcher = netframe_server::PacketDispatcherBuilder::new(codec, config.dispatcher.default_timeout).build();

    let listener = netframe_server::build_listener(bind_address, HeaderLayout::Modern, &config, dispatcher)?;

    listener.run().await?;

    Ok(())
}
