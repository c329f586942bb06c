use std::{
    env,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use crate::error::{IpcError, Result};

/// Channel used by the bundled server and client when none is given
pub const DEFAULT_CHANNEL: &str = "linkpipe";

/// Overrides the directory domain sockets are created in
pub const SOCKET_DIR_ENV: &str = "LINKPIPE_SOCKET_DIR";
/// Overrides the default channel name of the bundled binaries
pub const CHANNEL_ENV: &str = "LINKPIPE_CHANNEL";

const DEFAULT_SOCKET_DIR: &str = "/tmp";
const SOCKET_SUFFIX: &str = ".sock";

/// Namespace prefix of Windows named pipes
pub const PIPE_PREFIX: &str = r"\\.\pipe\";

/// Longest simple name accepted by [`validate_simple_name`]
pub const MAX_SIMPLE_NAME_LEN: usize = 100;

/// Size of each low-level read used to fill the line buffer, and the pipe
/// buffer size requested from the OS
pub const IO_CHUNK_SIZE: usize = 4096;

/// How long a named-pipe client waits for a busy server instance
pub const CLIENT_CONNECT_WAIT: Duration = Duration::from_secs(5);

/// Poll interval used where a backend has to emulate a timeout
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// `sun_path` capacity, minus the terminating NUL
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
pub const MAX_SOCKET_PATH_LEN: usize = 103;
/// `sun_path` capacity, minus the terminating NUL
#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
)))]
pub const MAX_SOCKET_PATH_LEN: usize = 107;

/// Directory domain sockets live in.
///
/// Read from `LINKPIPE_SOCKET_DIR` on first use and cached, so every
/// [`make_name`](crate::make_name) call in a process agrees.
pub fn socket_dir() -> &'static Path {
    static DIR: OnceLock<PathBuf> = OnceLock::new();
    DIR.get_or_init(|| {
        env::var_os(SOCKET_DIR_ENV)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_DIR))
    })
}

/// Channel name for the bundled binaries: `LINKPIPE_CHANNEL` or the default
pub fn default_channel() -> String {
    env::var(CHANNEL_ENV)
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_CHANNEL.to_string())
}

/// Check that a short logical channel name is usable in every namespace.
///
/// Accepted: 1..=100 bytes of ASCII letters, digits, `-`, `_` and `.`, not
/// starting with a dot.
pub fn validate_simple_name(simple: &str) -> Result<()> {
    if simple.is_empty() {
        return Err(IpcError::invalid_name(simple, "name is empty"));
    }
    if simple.len() > MAX_SIMPLE_NAME_LEN {
        return Err(IpcError::invalid_name(
            simple,
            format!("name is longer than {MAX_SIMPLE_NAME_LEN} bytes"),
        ));
    }
    if simple.starts_with('.') {
        return Err(IpcError::invalid_name(simple, "name starts with '.'"));
    }
    if let Some(bad) = simple
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(IpcError::invalid_name(
            simple,
            format!("character {bad:?} is not allowed"),
        ));
    }
    Ok(())
}

/// Socket path for `simple` inside `dir`.
///
/// Pure: depends only on its arguments.
pub fn make_name_in(dir: &Path, simple: &str) -> Result<String> {
    validate_simple_name(simple)?;

    let file_name = if simple.ends_with(SOCKET_SUFFIX) {
        simple.to_string()
    } else {
        format!("{simple}{SOCKET_SUFFIX}")
    };
    let path = dir.join(file_name);
    let path = path
        .to_str()
        .ok_or_else(|| IpcError::invalid_name(simple, "socket directory is not valid UTF-8"))?
        .to_string();

    if path.len() > MAX_SOCKET_PATH_LEN {
        return Err(IpcError::invalid_name(
            simple,
            format!("socket path {path:?} exceeds {MAX_SOCKET_PATH_LEN} bytes"),
        ));
    }
    Ok(path)
}

/// Named pipe path for `simple`
pub fn make_pipe_name(simple: &str) -> Result<String> {
    validate_simple_name(simple)?;
    Ok(format!("{PIPE_PREFIX}{simple}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_names() {
        for bad in ["", ".hidden", "a/b", r"a\b", "has space", "nul\0", "ünï"] {
            let err = validate_simple_name(bad).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::InvalidName, "{bad:?}");
        }
        let long = "x".repeat(MAX_SIMPLE_NAME_LEN + 1);
        assert!(validate_simple_name(&long).is_err());
    }

    #[test]
    fn accepts_plain_names() {
        for good in ["test-channel", "a", "svc_01", "linkpipe.sock", "v1.2"] {
            validate_simple_name(good).unwrap();
        }
    }

    #[test]
    fn socket_names_are_deterministic() {
        let dir = Path::new("/run/user/1000");
        let first = make_name_in(dir, "test-channel").unwrap();
        let second = make_name_in(dir, "test-channel").unwrap();
        assert_eq!(first, "/run/user/1000/test-channel.sock");
        assert_eq!(first, second);
    }

    #[test]
    fn socket_suffix_is_not_doubled() {
        let name = make_name_in(Path::new("/tmp"), "linkpipe.sock").unwrap();
        assert_eq!(name, "/tmp/linkpipe.sock");
    }

    #[test]
    fn overlong_socket_paths_are_rejected() {
        let dir = PathBuf::from(format!("/{}", "d".repeat(90)));
        let err = make_name_in(&dir, "channel-with-a-long-name").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidName);
    }

    #[test]
    fn pipe_names_use_the_pipe_namespace() {
        assert_eq!(make_pipe_name("test-channel").unwrap(), r"\\.\pipe\test-channel");
        assert!(make_pipe_name("").is_err());
    }
}
