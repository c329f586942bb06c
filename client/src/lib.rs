//! linkpipe Client Library
//!
//! This crate provides a request/reply client for the linkpipe line server.
//! It talks over the native transport (Unix domain sockets on Unix-like
//! systems, named pipes on Windows), one text line per request and reply.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use linkpipe_client::{ClientConfig, IpcClient};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = ClientConfig::new()
//!     .with_channel("linkpipe")?
//!     .with_timeout(Duration::from_secs(10));
//!
//! let mut client = IpcClient::new(config);
//! client.connect()?;
//!
//! let response = client.send_request("status")?;
//! println!("Server status: {}", response);
//!
//! client.disconnect()?;
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::*;
// Re-export important types from linkpipe-common for convenience
pub use linkpipe_common::{config::DEFAULT_CHANNEL, make_name, IpcError};
