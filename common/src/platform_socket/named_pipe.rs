use std::{
    ffi::OsStr,
    io,
    os::windows::ffi::OsStrExt,
    ptr,
    time::{Duration, Instant},
};

use windows_sys::Win32::{
    Foundation::{
        CloseHandle, ERROR_ACCESS_DENIED, ERROR_BROKEN_PIPE, ERROR_FILE_NOT_FOUND, ERROR_NO_DATA,
        ERROR_PIPE_BUSY, ERROR_PIPE_CONNECTED, ERROR_PIPE_LISTENING, ERROR_PIPE_NOT_CONNECTED,
        GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
    },
    Storage::FileSystem::{
        CreateFileW, FlushFileBuffers, ReadFile, WriteFile, FILE_FLAG_FIRST_PIPE_INSTANCE, OPEN_EXISTING,
        PIPE_ACCESS_DUPLEX,
    },
    System::Pipes::{
        ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, GetNamedPipeClientProcessId,
        GetNamedPipeServerProcessId, PeekNamedPipe, SetNamedPipeHandleState, WaitNamedPipeW,
        PIPE_NOWAIT, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE, PIPE_WAIT,
    },
};

use super::{PeerCredentials, Transport};
use crate::{
    config::{self, CLIENT_CONNECT_WAIT, IO_CHUNK_SIZE, PIPE_PREFIX, POLL_INTERVAL},
    error::{IpcError, Result},
};

/// Longest pipe path Windows accepts
const MAX_PIPE_NAME_LEN: usize = 256;

/// Windows named pipe transport.
///
/// Synchronous byte-mode pipe with a single instance. The server keeps its
/// pipe handle across clients and re-arms it with `DisconnectNamedPipe`.
#[derive(Debug)]
pub struct NamedPipe {
    name:      String,
    handle:    HANDLE,
    is_server: bool,
    connected: bool,
}

// SAFETY: a pipe HANDLE is a kernel object reference that may be used from any
// thread; the handle is exclusively owned by this value.
unsafe impl Send for NamedPipe {}

impl Transport for NamedPipe {
    const KIND: &'static str = "named pipe";

    fn make_name(simple: &str) -> Result<String> {
        config::make_pipe_name(simple)
    }

    fn listen(name: &str) -> Result<Self> {
        let wide = wide_pipe_name(name).map_err(|reason| IpcError::creation(name, reason))?;

        // SAFETY: `wide` is a NUL-terminated UTF-16 buffer that outlives the call;
        // null security attributes select the default descriptor.
        let handle = unsafe {
            CreateNamedPipeW(
                wide.as_ptr(),
                PIPE_ACCESS_DUPLEX | FILE_FLAG_FIRST_PIPE_INSTANCE,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
                1,
                IO_CHUNK_SIZE as u32,
                IO_CHUNK_SIZE as u32,
                0,
                ptr::null(),
            )
        };

        if handle == INVALID_HANDLE_VALUE {
            let err = io::Error::last_os_error();
            let reason = match raw_code(&err) {
                Some(ERROR_ACCESS_DENIED) | Some(ERROR_PIPE_BUSY) => {
                    format!("another server already owns this pipe ({err})")
                }
                _ => err.to_string(),
            };
            return Err(IpcError::creation(name, reason));
        }

        tracing::info!(name, "Named pipe server created");
        Ok(Self {
            name: name.to_string(),
            handle,
            is_server: true,
            connected: false,
        })
    }

    fn connect(name: &str) -> Result<Self> {
        let wide = wide_pipe_name(name).map_err(|reason| IpcError::connection(name, reason))?;
        let mut waited = false;

        loop {
            // SAFETY: `wide` is a NUL-terminated UTF-16 buffer that outlives the call;
            // no template handle or security attributes are passed.
            let handle = unsafe {
                CreateFileW(
                    wide.as_ptr(),
                    GENERIC_READ | GENERIC_WRITE,
                    0,
                    ptr::null(),
                    OPEN_EXISTING,
                    0,
                    ptr::null_mut(),
                )
            };

            if handle != INVALID_HANDLE_VALUE {
                tracing::info!(name, "Connected to named pipe");
                return Ok(Self {
                    name: name.to_string(),
                    handle,
                    is_server: false,
                    connected: true,
                });
            }

            let err = io::Error::last_os_error();
            match raw_code(&err) {
                Some(ERROR_PIPE_BUSY) if !waited => {
                    tracing::debug!(name, "Named pipe busy, waiting for a free instance");
                    waited = true;
                    // SAFETY: `wide` is a valid NUL-terminated UTF-16 pipe name.
                    let free = unsafe {
                        WaitNamedPipeW(wide.as_ptr(), CLIENT_CONNECT_WAIT.as_millis() as u32)
                    };
                    if free == 0 {
                        return Err(IpcError::connection(
                            name,
                            "server is busy with another client",
                        ));
                    }
                }
                Some(ERROR_PIPE_BUSY) => {
                    return Err(IpcError::connection(
                        name,
                        "server is busy with another client",
                    ))
                }
                Some(ERROR_FILE_NOT_FOUND) => {
                    return Err(IpcError::connection(name, "no server is listening"))
                }
                Some(ERROR_ACCESS_DENIED) => {
                    return Err(IpcError::connection(name, format!("permission denied ({err})")))
                }
                _ => return Err(IpcError::connection(name, err.to_string())),
            }
        }
    }

    fn accept(&mut self, timeout: Option<Duration>) -> Result<()> {
        match timeout {
            None => self.accept_blocking()?,
            Some(timeout) => self.accept_polling(timeout)?,
        }
        self.connected = true;
        tracing::info!(name = %self.name, "Client connected");
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.flush_to_client();
        // SAFETY: `self.handle` is an open server pipe handle owned by this value.
        let ok = unsafe { DisconnectNamedPipe(self.handle) };
        if ok == 0 {
            return Err(IpcError::io("disconnect", io::Error::last_os_error()));
        }
        self.connected = false;
        tracing::debug!(name = %self.name, "Client disconnected");
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let len = buf.len().min(u32::MAX as usize) as u32;
        let mut bytes_read = 0u32;
        // SAFETY: the buffer pointer/length pair describes `buf`, `bytes_read` is a
        // live stack variable and a null OVERLAPPED selects synchronous I/O.
        let ok = unsafe {
            ReadFile(
                self.handle,
                buf.as_mut_ptr().cast(),
                len,
                &mut bytes_read,
                ptr::null_mut(),
            )
        };
        if ok != 0 {
            return Ok(bytes_read as usize);
        }

        let err = io::Error::last_os_error();
        match raw_code(&err) {
            // The peer closed its end
            Some(ERROR_BROKEN_PIPE) | Some(ERROR_PIPE_NOT_CONNECTED) => Ok(0),
            _ => Err(IpcError::io("read", err)),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let len = data.len().min(u32::MAX as usize) as u32;
        let mut bytes_written = 0u32;
        // SAFETY: the pointer/length pair describes `data`, `bytes_written` is a
        // live stack variable and a null OVERLAPPED selects synchronous I/O.
        let ok = unsafe {
            WriteFile(
                self.handle,
                data.as_ptr().cast(),
                len,
                &mut bytes_written,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(IpcError::io("write", io::Error::last_os_error()));
        }
        Ok(bytes_written as usize)
    }

    fn poll_readable(&mut self) -> Result<bool> {
        let mut available = 0u32;
        // SAFETY: only the total-available out parameter is requested; it points to
        // a live stack variable. No data is copied or removed from the pipe.
        let ok = unsafe {
            PeekNamedPipe(
                self.handle,
                ptr::null_mut(),
                0,
                ptr::null_mut(),
                &mut available,
                ptr::null_mut(),
            )
        };
        if ok != 0 {
            return Ok(available > 0);
        }

        let err = io::Error::last_os_error();
        match raw_code(&err) {
            Some(ERROR_BROKEN_PIPE) | Some(ERROR_PIPE_NOT_CONNECTED) => Ok(false),
            _ => Err(IpcError::io("data_available", err)),
        }
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        // Synchronous pipe reads cannot be bounded without overlapped I/O, so the
        // setting is accepted and reads keep blocking.
        if timeout.is_some() {
            tracing::debug!(name = %self.name, "Read timeouts are not enforced on named pipes");
        }
        Ok(())
    }

    fn peer_credentials(&self) -> Result<PeerCredentials> {
        let mut pid = 0u32;
        // SAFETY: `self.handle` is an open pipe handle and `pid` a live stack variable.
        let ok = unsafe {
            if self.is_server {
                GetNamedPipeClientProcessId(self.handle, &mut pid)
            } else {
                GetNamedPipeServerProcessId(self.handle, &mut pid)
            }
        };
        if ok == 0 {
            return Err(IpcError::io("peer_credentials", io::Error::last_os_error()));
        }
        Ok(PeerCredentials { pid, uid: None })
    }
}

impl NamedPipe {
    fn accept_blocking(&mut self) -> Result<()> {
        // SAFETY: `self.handle` is an open server pipe handle; a null OVERLAPPED
        // makes the call block until a client connects.
        let ok = unsafe { ConnectNamedPipe(self.handle, ptr::null_mut()) };
        if ok != 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match raw_code(&err) {
            // Client connected between CreateNamedPipe and ConnectNamedPipe
            Some(ERROR_PIPE_CONNECTED) => Ok(()),
            _ => Err(IpcError::Accept(err.to_string())),
        }
    }

    /// Emulates an accept deadline: in PIPE_NOWAIT mode ConnectNamedPipe returns
    /// at once, so it is retried every [`POLL_INTERVAL`] until a client arrives.
    fn accept_polling(&mut self, timeout: Duration) -> Result<()> {
        self.set_wait_mode(false)
            .map_err(|e| IpcError::Accept(format!("failed to enter polling mode: {e}")))?;
        let outcome = self.poll_for_client(timeout);
        let restored = self
            .set_wait_mode(true)
            .map_err(|e| IpcError::Accept(format!("failed to restore blocking mode: {e}")));
        outcome.and(restored)
    }

    fn poll_for_client(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            // SAFETY: `self.handle` is an open server pipe handle in PIPE_NOWAIT mode.
            let ok = unsafe { ConnectNamedPipe(self.handle, ptr::null_mut()) };
            let err = io::Error::last_os_error();
            match (ok, raw_code(&err)) {
                (0, Some(ERROR_PIPE_CONNECTED)) => return Ok(()),
                (0, Some(ERROR_PIPE_LISTENING)) => {}
                (0, Some(ERROR_NO_DATA)) => {
                    // A client came and went; clear the instance and keep listening
                    // SAFETY: `self.handle` is an open server pipe handle.
                    unsafe { DisconnectNamedPipe(self.handle) };
                }
                (0, _) => return Err(IpcError::Accept(err.to_string())),
                _ => return Ok(()),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(IpcError::Timeout {
                    operation: "wait_for_connection",
                    after:     timeout,
                });
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Block until the client has read everything written so far.
    ///
    /// DisconnectNamedPipe discards unread data, so the last reply would be lost
    /// without this. A client that already left makes the flush fail, which is
    /// fine: nobody is left to read.
    fn flush_to_client(&self) {
        // SAFETY: `self.handle` is an open server pipe handle owned by this value.
        if unsafe { FlushFileBuffers(self.handle) } == 0 {
            tracing::debug!(
                name = %self.name,
                error = %io::Error::last_os_error(),
                "Flush before disconnect failed"
            );
        }
    }

    fn set_wait_mode(&self, blocking: bool) -> io::Result<()> {
        let mode = PIPE_READMODE_BYTE | if blocking { PIPE_WAIT } else { PIPE_NOWAIT };
        // SAFETY: `self.handle` is an open pipe handle and `mode` a live stack value;
        // the collection parameters are left unchanged (null).
        let ok = unsafe { SetNamedPipeHandleState(self.handle, &mode, ptr::null(), ptr::null()) };
        if ok == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Drop for NamedPipe {
    fn drop(&mut self) {
        if self.is_server && self.connected {
            self.flush_to_client();
            // SAFETY: `self.handle` is an open server pipe handle.
            unsafe { DisconnectNamedPipe(self.handle) };
        }
        // SAFETY: the handle is owned by this value and closed exactly once here.
        unsafe { CloseHandle(self.handle) };
    }
}

fn raw_code(err: &io::Error) -> Option<u32> {
    err.raw_os_error().map(|code| code as u32)
}

/// Validate a full pipe path and encode it for the wide Win32 API
fn wide_pipe_name(name: &str) -> std::result::Result<Vec<u16>, String> {
    let Some(rest) = name.strip_prefix(PIPE_PREFIX) else {
        return Err(format!("pipe names must start with {PIPE_PREFIX}"));
    };
    if rest.is_empty() {
        return Err("pipe name is empty".to_string());
    }
    if rest.contains('\\') || rest.contains('\0') {
        return Err("pipe name contains '\\' or a NUL byte".to_string());
    }
    if name.len() > MAX_PIPE_NAME_LEN {
        return Err(format!("pipe name exceeds {MAX_PIPE_NAME_LEN} characters"));
    }
    Ok(OsStr::new(name)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect())
}
