//! Linkpipe Common Library
//!
//! One handle type for same-host byte-stream IPC over Unix domain sockets
//! or Windows named pipes. It includes:
//!
//! - [`IpcHandle`]: server and client lifecycle, raw and line-oriented I/O
//! - Platform transports behind the [`Transport`] trait
//! - Channel naming and environment configuration
//! - A typed error with per-handle error text
//!
//! # Example
//!
//! ```no_run
//! use linkpipe_common::{make_name, IpcHandle};
//!
//! # fn main() -> linkpipe_common::Result<()> {
//! let name = make_name("demo")?;
//! let mut client: IpcHandle = IpcHandle::connect_client(&name)?;
//! client.write_line("PING")?;
//! if let Some(reply) = client.read_line(256)?.into_data() {
//!     println!("{reply}");
//! }
//! # Ok(())
//! # }
//! ```

/// Channel naming, limits and environment configuration
pub mod config;

/// Error type shared by every operation
pub mod error;

/// The transport handle
pub mod handle;

/// Platform-specific transport implementations
pub mod platform_socket;

// Re-export commonly used types for convenience
pub use error::{ErrorKind, IpcError, Result, Role};
pub use handle::{ConnectionState, IpcHandle, ReadOutcome};
pub use platform_socket::{DomainSocket, NamedPipe, NativeTransport, PeerCredentials, Transport};

/// Map a short channel name to the native transport's full name.
///
/// Unix: `{LINKPIPE_SOCKET_DIR or /tmp}/{simple}.sock`. Windows:
/// `\\.\pipe\{simple}`.
pub fn make_name(simple: &str) -> Result<String> {
    NativeTransport::make_name(simple)
}
