use std::{
    fs,
    io::{self, Read},
    net::Shutdown,
    os::unix::{
        fs::{FileTypeExt, PermissionsExt},
        io::{AsRawFd, RawFd},
        net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

#[cfg(any(target_os = "linux", target_os = "android"))]
use nix::sys::socket::{getsockopt, sockopt};

use super::{PeerCredentials, Transport};
use crate::{
    config::{self, MAX_SOCKET_PATH_LEN},
    error::{IpcError, Result},
};

/// Unix domain socket transport.
///
/// A server owns a non-blocking listener plus at most one accepted stream; a
/// client owns only its stream. Names are filesystem paths, or on Linux
/// `@name` for the abstract namespace.
#[derive(Debug)]
pub struct DomainSocket {
    name:         String,
    listener:     Option<UnixListener>,
    /// Socket file this server created and must remove again
    socket_file:  Option<PathBuf>,
    stream:       Option<UnixStream>,
    read_timeout: Option<Duration>,
}

impl Transport for DomainSocket {
    const KIND: &'static str = "domain socket";

    fn make_name(simple: &str) -> Result<String> {
        config::make_name_in(config::socket_dir(), simple)
    }

    fn listen(name: &str) -> Result<Self> {
        check_name(name).map_err(|reason| IpcError::creation(name, reason))?;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            if let Some(abstract_name) = name.strip_prefix('@') {
                let listener =
                    bind_abstract(abstract_name).map_err(|e| creation_error(name, &e))?;
                listener
                    .set_nonblocking(true)
                    .map_err(|e| creation_error(name, &e))?;
                tracing::info!(name, "Listening on abstract Unix socket");
                return Ok(Self::server(name, listener, None));
            }
        }

        let path = Path::new(name);
        reclaim_stale_socket(name, path)?;

        let listener = UnixListener::bind(path).map_err(|e| creation_error(name, &e))?;
        // Owned from here on, so every early return below cleans the file up
        let socket = Self::server(name, listener, Some(path.to_path_buf()));
        if let Some(listener) = &socket.listener {
            listener
                .set_nonblocking(true)
                .map_err(|e| creation_error(name, &e))?;
        }

        // Owner read/write only
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
            tracing::warn!(name, error = %e, "Failed to set socket permissions");
        }

        tracing::info!(name, "Listening on Unix socket");
        Ok(socket)
    }

    fn connect(name: &str) -> Result<Self> {
        check_name(name).map_err(|reason| IpcError::connection(name, reason))?;

        let stream = connect_stream(name).map_err(|e| connection_error(name, &e))?;
        configure_stream(&stream, None).map_err(|e| connection_error(name, &e))?;

        tracing::info!(name, "Connected to Unix socket");
        Ok(Self {
            name:         name.to_string(),
            listener:     None,
            socket_file:  None,
            stream:       Some(stream),
            read_timeout: None,
        })
    }

    fn accept(&mut self, timeout: Option<Duration>) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| IpcError::Accept("no listening socket".to_string()))?;
        let deadline = timeout.map(|t| Instant::now() + t);

        let stream = loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let ready = wait_readable(listener.as_raw_fd(), remaining)
                .map_err(|e| IpcError::Accept(format!("poll failed: {e}")))?;
            if !ready {
                return Err(IpcError::Timeout {
                    operation: "wait_for_connection",
                    after:     timeout.unwrap_or_default(),
                });
            }

            match listener.accept() {
                Ok((stream, _)) => break stream,
                // The pending connection went away between poll and accept
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(IpcError::Accept(e.to_string())),
            }
        };

        configure_stream(&stream, self.read_timeout)
            .map_err(|e| IpcError::Accept(format!("failed to configure stream: {e}")))?;
        tracing::info!(name = %self.name, "Client connected");
        self.stream = Some(stream);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            match stream.shutdown(Shutdown::Both) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                Err(e) => tracing::debug!(error = %e, "shutdown before disconnect failed"),
            }
            tracing::debug!(name = %self.name, "Client disconnected");
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(IpcError::NotConnected { operation: "read" })?;
        loop {
            match stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(IpcError::Timeout {
                        operation: "read",
                        after:     self.read_timeout.unwrap_or_default(),
                    })
                }
                Err(e) => return Err(IpcError::io("read", e)),
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self
            .stream
            .as_ref()
            .ok_or(IpcError::NotConnected { operation: "write" })?;
        loop {
            match send_once(stream, data) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(IpcError::io("write", e)),
            }
        }
    }

    fn poll_readable(&mut self) -> Result<bool> {
        let stream = self.stream.as_ref().ok_or(IpcError::NotConnected {
            operation: "data_available",
        })?;
        let mut byte = 0u8;
        loop {
            // SAFETY: the descriptor is owned by `stream` and open for the duration
            // of the call; the buffer is a single valid stack byte. MSG_PEEK leaves
            // the data queued.
            let peeked = unsafe {
                libc::recv(
                    stream.as_raw_fd(),
                    (&mut byte as *mut u8).cast(),
                    1,
                    libc::MSG_PEEK | libc::MSG_DONTWAIT,
                )
            };
            if peeked > 0 {
                return Ok(true);
            }
            if peeked == 0 {
                // Peer closed; the next read reports end of stream
                return Ok(false);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return Ok(false),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(IpcError::io("data_available", err)),
            }
        }
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        if let Some(stream) = &self.stream {
            stream
                .set_read_timeout(timeout)
                .map_err(|e| IpcError::io("set_read_timeout", e))?;
        }
        self.read_timeout = timeout;
        Ok(())
    }

    fn peer_credentials(&self) -> Result<PeerCredentials> {
        let stream = self.stream.as_ref().ok_or(IpcError::NotConnected {
            operation: "peer_credentials",
        })?;
        peer_credentials(stream)
    }
}

impl DomainSocket {
    fn server(name: &str, listener: UnixListener, socket_file: Option<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            listener: Some(listener),
            socket_file,
            stream: None,
            read_timeout: None,
        }
    }
}

impl Drop for DomainSocket {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.listener = None;
        if let Some(path) = self.socket_file.take() {
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed socket file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove socket file")
                }
            }
        }
    }
}

fn check_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".to_string());
    }
    if name.contains('\0') {
        return Err("name contains a NUL byte".to_string());
    }
    if name.len() > MAX_SOCKET_PATH_LEN {
        return Err(format!("name exceeds {MAX_SOCKET_PATH_LEN} bytes"));
    }
    Ok(())
}

/// Make room for a new server at `path`.
///
/// Only a socket file whose connect is refused is left over from a dead
/// server and gets removed. A live server, a server we may not talk to, or a
/// non-socket file is an error.
fn reclaim_stale_socket(name: &str, path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(IpcError::creation(
                name,
                format!("cannot inspect existing path: {e}"),
            ))
        }
    };

    if !metadata.file_type().is_socket() {
        return Err(IpcError::creation(name, "path exists and is not a socket"));
    }

    match probe_existing_socket(UnixStream::connect(path).map(drop)) {
        Probe::Vanished => Ok(()),
        Probe::Stale(refused) => {
            tracing::warn!(name, error = %refused, "Removing stale socket file");
            match fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(IpcError::creation(
                    name,
                    format!("could not remove stale socket file: {e}"),
                )),
            }
        }
        Probe::Held(reason) => Err(IpcError::creation(name, reason)),
    }
}

/// What a connect attempt says about an existing socket file
#[derive(Debug)]
enum Probe {
    /// Removed by someone else since it was inspected
    Vanished,
    /// Nobody listens; safe to unlink
    Stale(io::Error),
    /// Possibly owned by a live server; must be left alone
    Held(String),
}

fn probe_existing_socket(connect: io::Result<()>) -> Probe {
    match connect {
        Ok(()) => Probe::Held("another server is already listening on this name".to_string()),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => Probe::Stale(e),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Probe::Vanished,
        Err(e) => Probe::Held(format!(
            "existing socket may belong to a live server ({e})"
        )),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_abstract(name: &str) -> io::Result<UnixListener> {
    #[cfg(target_os = "android")]
    use std::os::android::net::SocketAddrExt;
    #[cfg(target_os = "linux")]
    use std::os::linux::net::SocketAddrExt;

    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    UnixListener::bind_addr(&addr)
}

fn connect_stream(name: &str) -> io::Result<UnixStream> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        #[cfg(target_os = "android")]
        use std::os::android::net::SocketAddrExt;
        #[cfg(target_os = "linux")]
        use std::os::linux::net::SocketAddrExt;

        if let Some(abstract_name) = name.strip_prefix('@') {
            let addr =
                std::os::unix::net::SocketAddr::from_abstract_name(abstract_name.as_bytes())?;
            return UnixStream::connect_addr(&addr);
        }
    }
    UnixStream::connect(name)
}

/// Blocking mode, read timeout and no SIGPIPE on write
fn configure_stream(stream: &UnixStream, read_timeout: Option<Duration>) -> io::Result<()> {
    // Accepted sockets inherit O_NONBLOCK from the listener on BSD-derived systems
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(read_timeout)?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    suppress_sigpipe(stream)?;
    Ok(())
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn suppress_sigpipe(stream: &UnixStream) -> io::Result<()> {
    let on: libc::c_int = 1;
    // SAFETY: setsockopt is called with an open descriptor owned by `stream` and a
    // pointer/length pair describing a live c_int on the stack.
    let result = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            (&on as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn send_once(stream: &UnixStream, data: &[u8]) -> io::Result<usize> {
    // SAFETY: the descriptor is owned by `stream` and open; the pointer/length pair
    // describes the borrowed `data` slice. MSG_NOSIGNAL turns a closed peer into
    // EPIPE instead of a process-wide SIGPIPE.
    let sent = unsafe {
        libc::send(
            stream.as_raw_fd(),
            data.as_ptr().cast(),
            data.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if sent < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(sent as usize)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn send_once(stream: &UnixStream, data: &[u8]) -> io::Result<usize> {
    use std::io::Write;

    let mut stream = stream;
    stream.write(data)
}

/// Wait until `fd` is readable; `Ok(false)` when `timeout` elapses first
fn wait_readable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let timeout_ms: libc::c_int = match deadline {
            None => -1,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                remaining
                    .as_nanos()
                    .div_ceil(1_000_000)
                    .min(libc::c_int::MAX as u128) as libc::c_int
            }
        };

        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: `pollfd` is a valid, initialized stack value and nfds is 1.
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        match ready {
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            0 => return Ok(false),
            _ => return Ok(true),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn peer_credentials(stream: &UnixStream) -> Result<PeerCredentials> {
    let creds = getsockopt(stream, sockopt::PeerCredentials)
        .map_err(|errno| IpcError::io("peer_credentials", errno.into()))?;
    Ok(PeerCredentials {
        pid: creds.pid() as u32,
        uid: Some(creds.uid()),
    })
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn peer_credentials(stream: &UnixStream) -> Result<PeerCredentials> {
    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;
    // SAFETY: getpeereid is called with an open descriptor owned by `stream` and
    // pointers to initialized stack variables.
    let result = unsafe { libc::getpeereid(stream.as_raw_fd(), &mut uid, &mut gid) };
    if result != 0 {
        return Err(IpcError::io("peer_credentials", io::Error::last_os_error()));
    }

    let mut pid: libc::pid_t = 0;
    let mut pid_len = std::mem::size_of::<libc::pid_t>() as libc::socklen_t;
    // SAFETY: getsockopt is called with an open descriptor, a valid level/option
    // pair and a pointer/length pair describing `pid`.
    let result = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_LOCAL,
            libc::LOCAL_PEERPID,
            (&mut pid as *mut libc::pid_t).cast(),
            &mut pid_len,
        )
    };
    if result != 0 {
        return Err(IpcError::io("peer_credentials", io::Error::last_os_error()));
    }

    Ok(PeerCredentials {
        pid: pid as u32,
        uid: Some(uid),
    })
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
fn peer_credentials(_stream: &UnixStream) -> Result<PeerCredentials> {
    Err(IpcError::UnsupportedPlatform {
        transport: "domain socket peer credentials",
    })
}

fn creation_error(name: &str, e: &io::Error) -> IpcError {
    let reason = match e.kind() {
        io::ErrorKind::PermissionDenied => format!("permission denied ({e})"),
        io::ErrorKind::AddrInUse => format!("address already in use ({e})"),
        io::ErrorKind::NotFound => format!("parent directory does not exist ({e})"),
        io::ErrorKind::InvalidInput => format!("invalid socket path ({e})"),
        _ => e.to_string(),
    };
    IpcError::creation(name, reason)
}

fn connection_error(name: &str, e: &io::Error) -> IpcError {
    let reason = match e.kind() {
        io::ErrorKind::NotFound => "no server is listening (socket not found)".to_string(),
        io::ErrorKind::ConnectionRefused => {
            "no server is listening (connection refused)".to_string()
        }
        io::ErrorKind::PermissionDenied => format!("permission denied ({e})"),
        _ => e.to_string(),
    };
    IpcError::connection(name, reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_readable_times_out_on_idle_listener() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(dir.path().join("idle.sock")).unwrap();
        let started = Instant::now();
        let ready = wait_readable(listener.as_raw_fd(), Some(Duration::from_millis(30))).unwrap();
        assert!(!ready);
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn wait_readable_sees_pending_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let _client = UnixStream::connect(&path).unwrap();
        assert!(wait_readable(listener.as_raw_fd(), Some(Duration::from_secs(1))).unwrap());
    }

    #[test]
    fn rejects_names_the_kernel_cannot_hold() {
        assert!(check_name("").is_err());
        assert!(check_name("/tmp/a\0b").is_err());
        assert!(check_name(&format!("/tmp/{}", "a".repeat(200))).is_err());
        assert!(check_name("/tmp/ok.sock").is_ok());
    }

    #[test]
    fn only_a_refused_connect_marks_a_socket_stale() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(matches!(probe_existing_socket(Err(refused)), Probe::Stale(_)));
        assert!(matches!(probe_existing_socket(Ok(())), Probe::Held(_)));
        assert!(matches!(
            probe_existing_socket(Err(io::Error::from(io::ErrorKind::NotFound))),
            Probe::Vanished
        ));
        for kind in [
            io::ErrorKind::PermissionDenied,
            io::ErrorKind::WouldBlock,
            io::ErrorKind::TimedOut,
        ] {
            assert!(
                matches!(probe_existing_socket(Err(io::Error::from(kind))), Probe::Held(_)),
                "{kind:?} must not unlink the socket"
            );
        }
    }

    #[test]
    fn leaves_a_socket_it_cannot_connect_to_in_place() {
        // SAFETY: geteuid has no preconditions.
        if unsafe { libc::geteuid() } == 0 {
            // Root bypasses the permission check this relies on
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guarded.sock");
        let name = path.to_str().unwrap();
        let _live = UnixListener::bind(&path).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o000)).unwrap();

        let err = DomainSocket::listen(name).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Creation);
        assert!(path.exists());
    }

    #[test]
    fn refuses_to_replace_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.sock");
        fs::write(&path, b"not a socket").unwrap();
        let name = path.to_str().unwrap();
        let err = DomainSocket::listen(name).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Creation);
        assert!(path.exists());
    }

    #[test]
    fn server_removes_its_socket_file_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("owned.sock");
        let server = DomainSocket::listen(path.to_str().unwrap()).unwrap();
        assert!(path.exists());
        drop(server);
        assert!(!path.exists());
    }
}
