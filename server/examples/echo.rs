use anyhow::{Context, Result};
use linkpipe_common::{make_name, IpcHandle, ReadOutcome};
use tracing::info;

/// Echo server built directly on the transport handle: every line a client
/// sends comes straight back, one client after another.
fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("=== linkpipe Echo Server Example ===");

    let name = make_name("linkpipe-echo").context("Failed to derive channel name")?;
    let mut server: IpcHandle =
        IpcHandle::create_server(&name).context("Failed to create echo server")?;

    println!("Server will listen on: {name}");
    println!("Press Ctrl+C to stop the server");

    loop {
        server
            .wait_for_connection(None)
            .context("Failed to accept client")?;
        info!("Client connected");

        while let ReadOutcome::Data(line) = server.read_line(4096)? {
            info!("Echoing: {}", line);
            server.write_line(&line)?;
        }

        info!("Client disconnected");
        server.disconnect()?;
    }
}
