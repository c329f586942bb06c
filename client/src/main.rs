use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use linkpipe_client::{ClientConfig, IpcClient};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "linkpipe-client")]
#[command(about = "linkpipe command line client", version)]
struct Args {
    /// Simple channel name (defaults to LINKPIPE_CHANNEL or "linkpipe")
    #[arg(short, long)]
    channel: Option<String>,

    /// Reply timeout in milliseconds
    #[arg(short, long, default_value_t = 5000)]
    timeout_ms: u64,

    #[arg(short, long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the server answers
    Ping,
    /// Get server status
    Status,
    /// Send a raw request line and print the reply
    Send {
        /// Request line, e.g. "echo hello"
        line: String,
    },
    /// Ask the server to stop
    Shutdown,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging; RUST_LOG wins over --log-level when set
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = ClientConfig::new().with_timeout(Duration::from_millis(args.timeout_ms));
    if let Some(channel) = &args.channel {
        config = config.with_channel(channel)?;
    }
    tracing::debug!("Using server: {}", config.name);

    match args.command {
        Commands::Ping => {
            IpcClient::quick_ping(config).context("Failed to ping server")?;
            println!("PONG");
        }

        Commands::Status => {
            let status =
                IpcClient::execute_command(config, "status").context("Failed to get server status")?;
            println!("Server status: {status}");
        }

        Commands::Send { line } => {
            let reply = IpcClient::execute_command(config, &line).context("Failed to send request")?;
            println!("{reply}");
        }

        Commands::Shutdown => {
            let mut client = IpcClient::new(config);
            client.connect()?;
            client.shutdown_server().context("Failed to shut down server")?;
            println!("Server is shutting down");
        }
    }

    Ok(())
}
