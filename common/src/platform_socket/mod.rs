//! Platform transports behind a single [`Transport`] interface.
//!
//! Unix builds get a real [`DomainSocket`] and a stub [`NamedPipe`]; Windows
//! builds get the reverse. [`NativeTransport`] names the real one.

use std::time::Duration;

use crate::error::Result;

#[cfg(unix)]
mod domain_socket;
#[cfg(windows)]
mod named_pipe;
mod unsupported;

#[cfg(unix)]
pub use domain_socket::DomainSocket;
#[cfg(windows)]
pub use named_pipe::NamedPipe;
#[cfg(not(unix))]
pub use unsupported::DomainSocket;
#[cfg(not(windows))]
pub use unsupported::NamedPipe;

/// The transport compiled in natively for this target
#[cfg(windows)]
pub type NativeTransport = NamedPipe;
/// The transport compiled in natively for this target
#[cfg(not(windows))]
pub type NativeTransport = DomainSocket;

/// Identity of the process on the other end of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Process ID of the peer
    pub pid: u32,
    /// User ID of the peer, where the platform reports one
    pub uid: Option<u32>,
}

/// Operations every backend provides.
///
/// Backends only move bytes and manage the native resource; role checks,
/// connection state, line buffering and error bookkeeping live in
/// [`IpcHandle`](crate::IpcHandle). Dropping a transport releases its
/// resource.
pub trait Transport: Sized + Send {
    /// Human readable transport name, used in diagnostics
    const KIND: &'static str;

    /// Map a short channel name into this transport's namespace
    fn make_name(simple: &str) -> Result<String>;

    /// Create a listening endpoint at `name`
    fn listen(name: &str) -> Result<Self>;

    /// Connect to the listening endpoint at `name`
    fn connect(name: &str) -> Result<Self>;

    /// Block until a client attaches, at most `timeout` when given
    fn accept(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// Drop the current client while keeping the listening endpoint
    fn disconnect(&mut self) -> Result<()>;

    /// One low-level read; `Ok(0)` means the peer closed the stream
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// One low-level write; may accept fewer bytes than offered
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Whether unread bytes are waiting, without consuming them
    fn poll_readable(&mut self) -> Result<bool>;

    /// Bound every blocking read; `None` blocks indefinitely
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// Credentials of the connected peer
    fn peer_credentials(&self) -> Result<PeerCredentials>;
}
