use std::{fmt, io, time::Duration};

use thiserror::Error;

/// Which side of a channel a handle plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The listening party
    Server,
    /// The connecting party
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => f.write_str("server"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// Coarse classification of an [`IpcError`], stable across backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Creation,
    Connection,
    Timeout,
    Accept,
    Io,
    UseAfterClose,
    UnsupportedPlatform,
    InvalidName,
    NotConnected,
    Role,
    InvalidArgument,
}

/// Errors produced by transport handles and backends
#[derive(Debug, Error)]
pub enum IpcError {
    /// The simple channel name cannot be mapped into the native namespace
    #[error("invalid channel name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    /// A server could not be created at the requested name
    #[error("cannot create server at {name:?}: {reason}")]
    Creation { name: String, reason: String },

    /// A client could not join the server at the requested name
    #[error("cannot connect to {name:?}: {reason}")]
    Connection { name: String, reason: String },

    /// A blocking operation ran past its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after:     Duration,
    },

    /// Accepting a client failed
    #[error("failed to accept client: {0}")]
    Accept(String),

    /// Read, write or poll failure on an established stream
    #[error("{operation} failed: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source:    io::Error,
    },

    #[error("{operation} called on a closed handle")]
    UseAfterClose { operation: &'static str },

    #[error("{transport} transport is not supported on this platform")]
    UnsupportedPlatform { transport: &'static str },

    #[error("{operation} requires a connected peer")]
    NotConnected { operation: &'static str },

    #[error("{operation} is only valid on a {expected} handle")]
    Role {
        operation: &'static str,
        expected:  Role,
    },

    #[error("invalid argument to {operation}: {reason}")]
    InvalidArgument {
        operation: &'static str,
        reason:    &'static str,
    },
}

impl IpcError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            IpcError::InvalidName { .. } => ErrorKind::InvalidName,
            IpcError::Creation { .. } => ErrorKind::Creation,
            IpcError::Connection { .. } => ErrorKind::Connection,
            IpcError::Timeout { .. } => ErrorKind::Timeout,
            IpcError::Accept(_) => ErrorKind::Accept,
            IpcError::Io { .. } => ErrorKind::Io,
            IpcError::UseAfterClose { .. } => ErrorKind::UseAfterClose,
            IpcError::UnsupportedPlatform { .. } => ErrorKind::UnsupportedPlatform,
            IpcError::NotConnected { .. } => ErrorKind::NotConnected,
            IpcError::Role { .. } => ErrorKind::Role,
            IpcError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
        }
    }

    pub(crate) fn io(operation: &'static str, source: io::Error) -> Self {
        IpcError::Io { operation, source }
    }

    pub(crate) fn creation(name: &str, reason: impl Into<String>) -> Self {
        IpcError::Creation {
            name:   name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn connection(name: &str, reason: impl Into<String>) -> Self {
        IpcError::Connection {
            name:   name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_name(name: &str, reason: impl Into<String>) -> Self {
        IpcError::InvalidName {
            name:   name.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<IpcError> for io::Error {
    fn from(err: IpcError) -> Self {
        let kind = match &err {
            IpcError::Io { source, .. } => source.kind(),
            IpcError::Timeout { .. } => io::ErrorKind::TimedOut,
            IpcError::NotConnected { .. } => io::ErrorKind::NotConnected,
            IpcError::UnsupportedPlatform { .. } => io::ErrorKind::Unsupported,
            IpcError::InvalidArgument { .. } | IpcError::InvalidName { .. } => {
                io::ErrorKind::InvalidInput
            }
            IpcError::Connection { .. } => io::ErrorKind::ConnectionRefused,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, IpcError>;
