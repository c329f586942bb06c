use std::time::Duration;

use anyhow::Result;
use linkpipe_client::{ClientConfig, IpcClient};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== linkpipe Client Basic Example ===");

    // Example 1: Using default configuration
    println!("\n1. Using default configuration:");
    example_with_defaults()?;

    // Example 2: One-shot operations
    println!("\n2. One-shot operations:");
    example_one_shot_operations()?;

    println!("\n✓ All examples completed successfully!");
    Ok(())
}

fn example_with_defaults() -> Result<()> {
    let mut client = IpcClient::with_defaults();

    println!("Connecting...");
    client.connect()?;

    println!("Sending ping...");
    client.ping()?;

    for command in ["status", "version", "echo Hello from linkpipe"] {
        let response = client.send_request(command)?;
        println!("  {command} -> {response}");
    }

    let stats = client.get_stats();
    println!(
        "Sent {} requests to {} (connected: {})",
        stats.requests_sent, stats.name, stats.connected
    );

    client.disconnect()?;
    Ok(())
}

fn example_one_shot_operations() -> Result<()> {
    let config = ClientConfig::new().with_timeout(Duration::from_secs(2));

    IpcClient::quick_ping(config.clone())?;
    println!("✓ Quick ping succeeded");

    let status = IpcClient::execute_command(config, "status")?;
    println!("✓ Server status: {status}");
    Ok(())
}
