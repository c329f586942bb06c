//! Stand-ins for transports the target has no native support for.
//!
//! Each stub fails every operation immediately with
//! [`IpcError::UnsupportedPlatform`], so callers compile and run the same
//! way everywhere.

use std::time::Duration;

use super::{PeerCredentials, Transport};
use crate::error::{IpcError, Result};

macro_rules! unsupported_transport {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name {
            _private: (),
        }

        impl $name {
            fn unsupported<T>() -> Result<T> {
                tracing::debug!(transport = $kind, "operation on unsupported transport");
                Err(IpcError::UnsupportedPlatform { transport: $kind })
            }
        }

        impl Transport for $name {
            const KIND: &'static str = $kind;

            fn make_name(_simple: &str) -> Result<String> {
                Self::unsupported()
            }

            fn listen(_name: &str) -> Result<Self> {
                Self::unsupported()
            }

            fn connect(_name: &str) -> Result<Self> {
                Self::unsupported()
            }

            fn accept(&mut self, _timeout: Option<Duration>) -> Result<()> {
                Self::unsupported()
            }

            fn disconnect(&mut self) -> Result<()> {
                Self::unsupported()
            }

            fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
                Self::unsupported()
            }

            fn write(&mut self, _data: &[u8]) -> Result<usize> {
                Self::unsupported()
            }

            fn poll_readable(&mut self) -> Result<bool> {
                Self::unsupported()
            }

            fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> Result<()> {
                Self::unsupported()
            }

            fn peer_credentials(&self) -> Result<PeerCredentials> {
                Self::unsupported()
            }
        }
    };
}

#[cfg(not(unix))]
unsupported_transport!(
    /// Unix domain sockets are not available on this target
    DomainSocket,
    "domain socket"
);

#[cfg(not(windows))]
unsupported_transport!(
    /// Windows named pipes are not available on this target
    NamedPipe,
    "named pipe"
);
