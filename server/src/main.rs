use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use linkpipe_server::{resolve_channel, LineServer, ServerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "linkpipe-server")]
#[command(about = "Line-oriented linkpipe server", version)]
struct Args {
    /// Simple channel name (defaults to LINKPIPE_CHANNEL or "linkpipe")
    #[arg(short, long)]
    channel: Option<String>,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Accept timeout in milliseconds between shutdown checks
    #[arg(long)]
    accept_poll_ms: Option<u64>,

    /// Longest request line read at once
    #[arg(long)]
    max_line: Option<usize>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level when set
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let channel = resolve_channel(args.channel);
    let mut config = ServerConfig::for_channel(&channel)?;
    if let Some(ms) = args.accept_poll_ms {
        config = config.with_accept_poll(Duration::from_millis(ms.max(1)));
    }
    if let Some(max_line) = args.max_line {
        config = config.with_max_line(max_line);
    }

    // Set up signal handling for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Received shutdown signal, stopping server...");
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let mut server = LineServer::bind(config).context("Failed to create server")?;
    let result = server.run_with_shutdown(running).context("Server error");
    server.shutdown();
    result
}
