//! The transport handle shared by every backend.

use std::{fmt, io, time::Duration};

use crate::{
    config::IO_CHUNK_SIZE,
    error::{IpcError, Result, Role},
    platform_socket::{NativeTransport, PeerCredentials, Transport},
};

/// Where a handle is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Backend allocated but not bound; never returned by the public constructors
    Unbound,
    /// Server waiting for a client
    Listening,
    /// A peer is attached
    Connected,
    /// The peer closed its end; a server must `disconnect` before re-arming
    Disconnected,
    /// Resource released; every fallible operation fails
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Unbound => "unbound",
            ConnectionState::Listening => "listening",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Result of a read: data, or a clean end of stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome<T> {
    Data(T),
    /// The peer closed the connection
    Eof,
}

impl<T> ReadOutcome<T> {
    /// The data, or `None` at end of stream
    pub fn into_data(self) -> Option<T> {
        match self {
            ReadOutcome::Data(data) => Some(data),
            ReadOutcome::Eof => None,
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, ReadOutcome::Eof)
    }
}

/// One end of a byte-stream channel.
///
/// Created with [`create_server`](Self::create_server) or
/// [`connect_client`](Self::connect_client). Every fallible operation records
/// its failure text for [`get_error`](Self::get_error) and clears it on
/// success. Bytes received past a line boundary are kept for the next read,
/// never dropped.
pub struct IpcHandle<T: Transport = NativeTransport> {
    name:       String,
    role:       Role,
    state:      ConnectionState,
    transport:  Option<T>,
    /// Bytes read from the transport but not yet returned
    pending:    Vec<u8>,
    last_error: Option<String>,
}

impl<T: Transport> IpcHandle<T> {
    /// Map a short channel name into the transport's namespace
    pub fn make_name(simple: &str) -> Result<String> {
        T::make_name(simple)
    }

    /// Create a server listening at `name`.
    ///
    /// The handle starts out `Listening`; call
    /// [`wait_for_connection`](Self::wait_for_connection) to attach a client.
    pub fn create_server(name: &str) -> Result<Self> {
        let transport = T::listen(name)?;
        tracing::debug!(name, transport = T::KIND, "Server handle created");
        Ok(Self::from_parts(name, Role::Server, ConnectionState::Listening, transport))
    }

    /// Connect to the server listening at `name`
    pub fn connect_client(name: &str) -> Result<Self> {
        let transport = T::connect(name)?;
        tracing::debug!(name, transport = T::KIND, "Client handle connected");
        Ok(Self::from_parts(name, Role::Client, ConnectionState::Connected, transport))
    }

    pub(crate) fn from_parts(name: &str, role: Role, state: ConnectionState, transport: T) -> Self {
        Self {
            name: name.to_string(),
            role,
            state,
            transport: Some(transport),
            pending: Vec::new(),
            last_error: None,
        }
    }

    /// Block until a client attaches (server only).
    ///
    /// `None` waits indefinitely. Fails with `Timeout` once the deadline
    /// passes, leaving the handle `Listening`. A previous client has to be
    /// released with [`disconnect`](Self::disconnect) first.
    pub fn wait_for_connection(&mut self, timeout: Option<Duration>) -> Result<()> {
        const OP: &str = "wait_for_connection";
        let result = self.server_transport(OP).and_then(|(state, transport)| {
            match state {
                ConnectionState::Listening => transport.accept(timeout),
                _ => Err(IpcError::Accept(format!(
                    "handle is {state}; disconnect the previous client first"
                ))),
            }
        });
        if result.is_ok() {
            self.state = ConnectionState::Connected;
        }
        self.track(result)
    }

    /// Detach the current client and go back to `Listening` (server only).
    ///
    /// A no-op when no client is attached. The listening endpoint stays open.
    pub fn disconnect(&mut self) -> Result<()> {
        const OP: &str = "disconnect";
        let result = self
            .server_transport(OP)
            .and_then(|(state, transport)| match state {
                ConnectionState::Listening => Ok(()),
                _ => transport.disconnect(),
            });
        if result.is_ok() {
            self.pending.clear();
            self.state = ConnectionState::Listening;
        }
        self.track(result)
    }

    /// Read up to `capacity` bytes.
    ///
    /// Buffered bytes are served first without touching the transport.
    /// Otherwise blocks until at least one byte arrives. `capacity == 0`
    /// returns empty data without any I/O.
    pub fn read(&mut self, capacity: usize) -> Result<ReadOutcome<Vec<u8>>> {
        let mut buf = vec![0u8; capacity];
        let result = self.read_into(&mut buf);
        result.map(|n| {
            if n == 0 && capacity > 0 {
                ReadOutcome::Eof
            } else {
                buf.truncate(n);
                ReadOutcome::Data(buf)
            }
        })
    }

    /// Read into `buf`, returning the byte count; `0` for a non-empty `buf`
    /// means the peer closed the connection
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        let result = self.read_step(buf);
        self.track(result)
    }

    fn read_step(&mut self, buf: &mut [u8]) -> Result<usize> {
        const OP: &str = "read";
        self.ensure_open(OP)?;
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.pending.is_empty() {
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(n);
        }
        self.read_transport(OP, buf)
    }

    /// Write all of `data`, retrying short writes; returns `data.len()`
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let result = self.write_all_step(data);
        self.track(result)
    }

    fn write_all_step(&mut self, data: &[u8]) -> Result<usize> {
        const OP: &str = "write";
        let transport = self.connected_transport(OP)?;
        let mut written = 0;
        while written < data.len() {
            match transport.write(&data[written..])? {
                0 => {
                    return Err(IpcError::io(
                        OP,
                        io::Error::new(io::ErrorKind::WriteZero, "transport accepted no bytes"),
                    ))
                }
                n => written += n,
            }
        }
        Ok(written)
    }

    /// Write `text` as-is; no newline is appended
    pub fn write_string(&mut self, text: &str) -> Result<usize> {
        self.write(text.as_bytes())
    }

    /// Write `text` followed by `\n`
    pub fn write_line(&mut self, text: &str) -> Result<usize> {
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        self.write(&line)
    }

    /// Read one line of at most `capacity - 1` bytes, without its `\n`.
    ///
    /// A line longer than that is returned in pieces. A final unterminated
    /// line is returned when the peer closes, and `Eof` after it. Invalid
    /// UTF-8 is replaced with U+FFFD; use
    /// [`read_line_bytes`](Self::read_line_bytes) for the raw bytes.
    pub fn read_line(&mut self, capacity: usize) -> Result<ReadOutcome<String>> {
        self.read_line_bytes(capacity).map(|outcome| match outcome {
            ReadOutcome::Data(bytes) => {
                ReadOutcome::Data(String::from_utf8_lossy(&bytes).into_owned())
            }
            ReadOutcome::Eof => ReadOutcome::Eof,
        })
    }

    /// Byte form of [`read_line`](Self::read_line)
    pub fn read_line_bytes(&mut self, capacity: usize) -> Result<ReadOutcome<Vec<u8>>> {
        let result = self.read_line_step(capacity);
        self.track(result)
    }

    fn read_line_step(&mut self, capacity: usize) -> Result<ReadOutcome<Vec<u8>>> {
        const OP: &str = "read_line";
        self.ensure_open(OP)?;
        if capacity < 2 {
            return Err(IpcError::InvalidArgument {
                operation: OP,
                reason:    "capacity must leave room for at least one byte and the terminator",
            });
        }
        let limit = capacity - 1;

        loop {
            let window = self.pending.len().min(limit + 1);
            if let Some(pos) = self.pending[..window].iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                return Ok(ReadOutcome::Data(line));
            }
            if self.pending.len() >= limit {
                return Ok(ReadOutcome::Data(self.pending.drain(..limit).collect()));
            }

            let mut chunk = [0u8; IO_CHUNK_SIZE];
            let n = self.read_transport(OP, &mut chunk)?;
            if n == 0 {
                if self.pending.is_empty() {
                    return Ok(ReadOutcome::Eof);
                }
                return Ok(ReadOutcome::Data(std::mem::take(&mut self.pending)));
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    /// Whether a read would return data right away. Never consumes bytes.
    pub fn data_available(&mut self) -> Result<bool> {
        let result = self.data_available_step();
        self.track(result)
    }

    fn data_available_step(&mut self) -> Result<bool> {
        const OP: &str = "data_available";
        self.ensure_open(OP)?;
        if !self.pending.is_empty() {
            return Ok(true);
        }
        match self.state {
            ConnectionState::Disconnected => Ok(false),
            _ => self.connected_transport(OP)?.poll_readable(),
        }
    }

    /// Bound each blocking read; an expired read fails with `Timeout` and keeps
    /// any partial line buffered. `None` restores indefinite blocking.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        const OP: &str = "set_read_timeout";
        let result = match timeout {
            Some(t) if t.is_zero() => Err(IpcError::InvalidArgument {
                operation: OP,
                reason:    "timeout must be non-zero",
            }),
            _ => self
                .open_transport(OP)
                .and_then(|transport| transport.set_read_timeout(timeout)),
        };
        self.track(result)
    }

    /// Process credentials of the connected peer
    pub fn peer_credentials(&mut self) -> Result<PeerCredentials> {
        const OP: &str = "peer_credentials";
        let result = self
            .connected_transport(OP)
            .and_then(|transport| transport.peer_credentials());
        self.track(result)
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Name the handle was created with
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Message of the most recent failure, if the last fallible call failed
    pub fn get_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Release the native resource. Calling it again is a no-op.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.transport = None;
        self.pending.clear();
        self.state = ConnectionState::Closed;
        tracing::debug!(name = %self.name, role = %self.role, "Handle closed");
    }

    /// One transport read; end of stream moves the handle to `Disconnected`
    fn read_transport(&mut self, operation: &'static str, buf: &mut [u8]) -> Result<usize> {
        if self.state == ConnectionState::Disconnected {
            return Ok(0);
        }
        let n = self.connected_transport(operation)?.read(buf)?;
        if n == 0 {
            tracing::debug!(name = %self.name, "Peer closed the connection");
            self.state = ConnectionState::Disconnected;
        }
        Ok(n)
    }

    fn ensure_open(&self, operation: &'static str) -> Result<()> {
        match self.state {
            ConnectionState::Closed => Err(IpcError::UseAfterClose { operation }),
            _ => Ok(()),
        }
    }

    fn open_transport(&mut self, operation: &'static str) -> Result<&mut T> {
        self.ensure_open(operation)?;
        self.transport
            .as_mut()
            .ok_or(IpcError::UseAfterClose { operation })
    }

    fn connected_transport(&mut self, operation: &'static str) -> Result<&mut T> {
        self.ensure_open(operation)?;
        if self.state != ConnectionState::Connected {
            return Err(IpcError::NotConnected { operation });
        }
        self.open_transport(operation)
    }

    fn server_transport(
        &mut self,
        operation: &'static str,
    ) -> Result<(ConnectionState, &mut T)> {
        self.ensure_open(operation)?;
        if self.role != Role::Server {
            return Err(IpcError::Role {
                operation,
                expected: Role::Server,
            });
        }
        let state = self.state;
        Ok((state, self.open_transport(operation)?))
    }

    /// Record the outcome of a fallible operation in `last_error`
    fn track<R>(&mut self, result: Result<R>) -> Result<R> {
        match &result {
            Ok(_) => self.last_error = None,
            Err(e) => {
                tracing::debug!(name = %self.name, error = %e, "Operation failed");
                self.last_error = Some(e.to_string());
            }
        }
        result
    }
}

impl<T: Transport> fmt::Debug for IpcHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcHandle")
            .field("name", &self.name)
            .field("transport", &T::KIND)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .field("last_error", &self.last_error)
            .finish()
    }
}

impl<T: Transport> io::Read for IpcHandle<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_into(buf).map_err(io::Error::from)
    }
}

impl<T: Transport> io::Write for IpcHandle<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        IpcHandle::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        // Writes go straight to the transport
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::ErrorKind;

    /// In-memory transport replaying scripted read chunks
    #[derive(Default)]
    struct ScriptedTransport {
        reads:        VecDeque<Vec<u8>>,
        written:      Vec<u8>,
        max_write:    Option<usize>,
        accepts:      usize,
        disconnects:  usize,
    }

    impl ScriptedTransport {
        fn with_reads(chunks: &[&[u8]]) -> Self {
            Self {
                reads: chunks.iter().map(|c| c.to_vec()).collect(),
                ..Self::default()
            }
        }
    }

    impl Transport for ScriptedTransport {
        const KIND: &'static str = "scripted";

        fn make_name(simple: &str) -> Result<String> {
            Ok(format!("mem:{simple}"))
        }

        fn listen(_name: &str) -> Result<Self> {
            Ok(Self::default())
        }

        fn connect(_name: &str) -> Result<Self> {
            Ok(Self::default())
        }

        fn accept(&mut self, _timeout: Option<Duration>) -> Result<()> {
            self.accepts += 1;
            Ok(())
        }

        fn disconnect(&mut self) -> Result<()> {
            self.disconnects += 1;
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let Some(mut chunk) = self.reads.pop_front() else {
                return Ok(0);
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.reads.push_front(chunk.split_off(n));
            }
            Ok(n)
        }

        fn write(&mut self, data: &[u8]) -> Result<usize> {
            let n = self.max_write.map_or(data.len(), |max| max.min(data.len()));
            self.written.extend_from_slice(&data[..n]);
            Ok(n)
        }

        fn poll_readable(&mut self) -> Result<bool> {
            Ok(self.reads.front().is_some_and(|c| !c.is_empty()))
        }

        fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> Result<()> {
            Ok(())
        }

        fn peer_credentials(&self) -> Result<PeerCredentials> {
            Ok(PeerCredentials { pid: 42, uid: None })
        }
    }

    fn client(chunks: &[&[u8]]) -> IpcHandle<ScriptedTransport> {
        IpcHandle::from_parts(
            "mem:test",
            Role::Client,
            ConnectionState::Connected,
            ScriptedTransport::with_reads(chunks),
        )
    }

    fn line(handle: &mut IpcHandle<ScriptedTransport>, capacity: usize) -> Option<String> {
        handle.read_line(capacity).unwrap().into_data()
    }

    #[test]
    fn read_line_splits_lines_in_one_chunk() {
        let mut handle = client(&[b"hello\nworld\n"]);
        assert_eq!(line(&mut handle, 64).as_deref(), Some("hello"));
        assert_eq!(line(&mut handle, 64).as_deref(), Some("world"));
        assert_eq!(line(&mut handle, 64), None);
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn read_line_joins_lines_across_chunks() {
        let mut handle = client(&[b"PI", b"NG", b"\nPO", b"NG\n"]);
        assert_eq!(line(&mut handle, 64).as_deref(), Some("PING"));
        assert_eq!(line(&mut handle, 64).as_deref(), Some("PONG"));
    }

    #[test]
    fn bytes_past_the_newline_are_kept_for_read() {
        let mut handle = client(&[b"head\nrest-of-stream"]);
        assert_eq!(line(&mut handle, 64).as_deref(), Some("head"));
        assert!(handle.data_available().unwrap());
        let data = handle.read(100).unwrap().into_data().unwrap();
        assert_eq!(data, b"rest-of-stream");
    }

    #[test]
    fn long_lines_are_returned_in_capacity_sized_pieces() {
        let mut handle = client(&[b"abcdefgh\n"]);
        assert_eq!(line(&mut handle, 4).as_deref(), Some("abc"));
        assert_eq!(line(&mut handle, 4).as_deref(), Some("def"));
        assert_eq!(line(&mut handle, 4).as_deref(), Some("gh"));
    }

    #[test]
    fn line_exactly_filling_capacity_consumes_its_newline() {
        let mut handle = client(&[b"abc\nxyz\n"]);
        assert_eq!(line(&mut handle, 4).as_deref(), Some("abc"));
        assert_eq!(line(&mut handle, 4).as_deref(), Some("xyz"));
    }

    #[test]
    fn unterminated_last_line_is_returned_before_eof() {
        let mut handle = client(&[b"one\ntwo"]);
        assert_eq!(line(&mut handle, 64).as_deref(), Some("one"));
        assert_eq!(line(&mut handle, 64).as_deref(), Some("two"));
        assert!(handle.read_line(64).unwrap().is_eof());
        assert!(handle.read(8).unwrap().is_eof());
    }

    #[test]
    fn empty_lines_are_preserved() {
        let mut handle = client(&[b"\n\nx\n"]);
        assert_eq!(line(&mut handle, 8).as_deref(), Some(""));
        assert_eq!(line(&mut handle, 8).as_deref(), Some(""));
        assert_eq!(line(&mut handle, 8).as_deref(), Some("x"));
    }

    #[test]
    fn invalid_utf8_is_replaced_in_strings_but_kept_in_bytes() {
        let mut handle = client(&[b"caf\xe9\n", b"caf\xe9\n"]);
        assert_eq!(line(&mut handle, 64).as_deref(), Some("caf\u{FFFD}"));
        let raw = handle.read_line_bytes(64).unwrap().into_data().unwrap();
        assert_eq!(raw, b"caf\xe9");
    }

    #[test]
    fn tiny_line_capacity_is_rejected() {
        let mut handle = client(&[b"x\n"]);
        let err = handle.read_line(1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(handle.get_error().is_some());
    }

    #[test]
    fn zero_capacity_read_is_not_eof() {
        let mut handle = client(&[b"data"]);
        assert_eq!(handle.read(0).unwrap(), ReadOutcome::Data(Vec::new()));
        assert_eq!(handle.read(16).unwrap(), ReadOutcome::Data(b"data".to_vec()));
    }

    #[test]
    fn write_retries_short_writes() {
        let mut handle = client(&[]);
        if let Some(transport) = handle.transport.as_mut() {
            transport.max_write = Some(3);
        }
        assert_eq!(handle.write(b"0123456789").unwrap(), 10);
        assert_eq!(handle.transport.as_ref().unwrap().written, b"0123456789");
    }

    #[test]
    fn write_string_adds_no_newline_but_write_line_does() {
        let mut handle = client(&[]);
        handle.write_string("PING").unwrap();
        handle.write_line("PONG").unwrap();
        assert_eq!(handle.transport.as_ref().unwrap().written, b"PINGPONG\n");
    }

    #[test]
    fn success_clears_a_previous_error() {
        let mut handle = client(&[b"ok\n"]);
        assert!(handle.disconnect().is_err());
        assert!(handle.get_error().unwrap().contains("server"));
        // Reading the error does not clear it
        assert!(handle.get_error().is_some());
        line(&mut handle, 16);
        assert_eq!(handle.get_error(), None);
    }

    #[test]
    fn client_handles_reject_server_operations() {
        let mut handle = client(&[]);
        assert_eq!(
            handle.wait_for_connection(None).unwrap_err().kind(),
            ErrorKind::Role
        );
        assert_eq!(handle.disconnect().unwrap_err().kind(), ErrorKind::Role);
        assert!(!handle.is_server());
    }

    #[test]
    fn server_lifecycle_requires_disconnect_before_rearming() {
        let mut server: IpcHandle<ScriptedTransport> =
            IpcHandle::create_server("mem:srv").unwrap();
        assert_eq!(server.state(), ConnectionState::Listening);
        assert_eq!(server.read(4).unwrap_err().kind(), ErrorKind::NotConnected);

        // No client yet: disconnect is a no-op success
        server.disconnect().unwrap();
        assert_eq!(server.transport.as_ref().unwrap().disconnects, 0);

        server.wait_for_connection(None).unwrap();
        assert!(server.is_connected());
        let err = server.wait_for_connection(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Accept);

        server.disconnect().unwrap();
        assert_eq!(server.state(), ConnectionState::Listening);
        server.wait_for_connection(None).unwrap();
        assert_eq!(server.transport.as_ref().unwrap().accepts, 2);
    }

    #[test]
    fn disconnect_drops_buffered_bytes_of_the_old_client() {
        let mut server: IpcHandle<ScriptedTransport> =
            IpcHandle::create_server("mem:srv").unwrap();
        server.wait_for_connection(None).unwrap();
        server
            .transport
            .as_mut()
            .unwrap()
            .reads
            .push_back(b"first\nleftover".to_vec());
        assert_eq!(line(&mut server, 32).as_deref(), Some("first"));
        server.disconnect().unwrap();
        server.wait_for_connection(None).unwrap();
        assert!(!server.data_available().unwrap());
    }

    #[test]
    fn every_operation_fails_after_close() {
        let mut handle = client(&[b"data\n"]);
        handle.close();
        handle.close();

        let kinds = [
            handle.read(4).unwrap_err().kind(),
            handle.read_line(4).unwrap_err().kind(),
            handle.write(b"x").unwrap_err().kind(),
            handle.write_string("x").unwrap_err().kind(),
            handle.data_available().unwrap_err().kind(),
            handle.wait_for_connection(None).unwrap_err().kind(),
            handle.disconnect().unwrap_err().kind(),
            handle.set_read_timeout(None).unwrap_err().kind(),
            handle.peer_credentials().unwrap_err().kind(),
        ];
        assert!(kinds.iter().all(|k| *k == ErrorKind::UseAfterClose), "{kinds:?}");
        assert!(handle.get_error().unwrap().contains("closed"));
        assert!(!handle.is_connected());
        assert_eq!(handle.state(), ConnectionState::Closed);
    }

    #[test]
    fn io_traits_delegate_to_the_handle() {
        use std::io::{Read, Write};

        let mut handle = client(&[b"abc"]);
        let mut buf = [0u8; 8];
        assert_eq!(Read::read(&mut handle, &mut buf).unwrap(), 3);
        write!(handle, "n={}", 7).unwrap();
        assert_eq!(handle.transport.as_ref().unwrap().written, b"n=7");
    }
}
