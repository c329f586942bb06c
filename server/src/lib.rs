use std::{
    env,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use linkpipe_common::{config, make_name, ErrorKind, IpcHandle, ReadOutcome};

/// Overrides how long each accept waits before re-checking the shutdown flag
pub const ACCEPT_POLL_ENV: &str = "LINKPIPE_ACCEPT_POLL_MS";
/// Overrides the longest request line the server reads at once
pub const MAX_LINE_ENV: &str = "LINKPIPE_MAX_LINE";

const DEFAULT_ACCEPT_POLL: Duration = Duration::from_millis(200);
const DEFAULT_MAX_LINE: usize = 4096;

/// Configuration for [`LineServer`]
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Full transport name to listen on
    pub name:        String,
    /// Accept timeout between shutdown-flag checks
    pub accept_poll: Duration,
    /// Capacity passed to `read_line`; longer requests arrive in pieces
    pub max_line:    usize,
}

impl ServerConfig {
    /// Creates a configuration listening on `name`
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name:        name.into(),
            accept_poll: DEFAULT_ACCEPT_POLL,
            max_line:    DEFAULT_MAX_LINE,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Reads LINKPIPE_CHANNEL, LINKPIPE_ACCEPT_POLL_MS and LINKPIPE_MAX_LINE;
    /// unparsable numbers fall back to the defaults.
    pub fn from_env() -> Result<Self> {
        Self::for_channel(&resolve_channel(None))
    }

    /// Listen on `channel`, taking the remaining settings from the environment
    pub fn for_channel(channel: &str) -> Result<Self> {
        let name =
            make_name(channel).with_context(|| format!("Invalid channel name: {channel}"))?;
        Ok(Self::new(name).with_env_overrides())
    }

    /// Apply LINKPIPE_ACCEPT_POLL_MS and LINKPIPE_MAX_LINE when set
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ms) = env_number::<u64>(ACCEPT_POLL_ENV) {
            self.accept_poll = Duration::from_millis(ms.max(1));
        }
        if let Some(max_line) = env_number::<usize>(MAX_LINE_ENV) {
            self.max_line = max_line;
        }
        self
    }

    /// Listen on the native name derived from a simple channel name
    pub fn with_channel(mut self, channel: &str) -> Result<Self> {
        self.name =
            make_name(channel).with_context(|| format!("Invalid channel name: {channel}"))?;
        Ok(self)
    }

    /// Listen on an already resolved transport name
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Set the accept poll interval
    pub fn with_accept_poll(mut self, accept_poll: Duration) -> Self {
        self.accept_poll = accept_poll;
        self
    }

    /// Set the request line capacity
    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }
}

/// The channel given on the command line, else LINKPIPE_CHANNEL, else the default
pub fn resolve_channel(cli: Option<String>) -> String {
    cli.unwrap_or_else(config::default_channel)
}

fn env_number<N: std::str::FromStr>(key: &str) -> Option<N> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable environment value");
            None
        }
    }
}

/// What the server does after answering a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Send the line and keep serving this client
    Line(String),
    /// Send the line, then drop this client and wait for the next
    Close(String),
    /// Send the line, then stop the server
    Shutdown(String),
}

impl Reply {
    fn text(&self) -> &str {
        match self {
            Reply::Line(text) | Reply::Close(text) | Reply::Shutdown(text) => text,
        }
    }
}

/// How a client session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Session {
    /// The client left or asked to quit
    Finished,
    /// The client asked the server to stop
    Shutdown,
}

/// A line-oriented server that serves one client at a time over a single
/// re-armed [`IpcHandle`].
pub struct LineServer {
    config: ServerConfig,
    handle: IpcHandle,
}

impl LineServer {
    /// Binds the listening endpoint described by `config`.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        if config.max_line < 2 {
            return Err(anyhow!(
                "max_line must be at least 2, got {}",
                config.max_line
            ));
        }

        tracing::info!("Starting linkpipe server on: {}", config.name);
        let handle = IpcHandle::create_server(&config.name)
            .with_context(|| format!("Failed to listen on: {}", config.name))?;
        tracing::info!("✓ Listening on: {}", config.name);

        Ok(Self { config, handle })
    }

    /// Returns the transport name this server listens on.
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Serves clients until a client sends `shutdown`.
    pub fn run(&mut self) -> Result<()> {
        self.run_with_shutdown(Arc::new(AtomicBool::new(true)))
    }

    /// Serves clients while `running` stays true or until a client sends
    /// `shutdown`. The flag is checked between accept polls, so a blocked
    /// client session is not interrupted.
    pub fn run_with_shutdown(&mut self, running: Arc<AtomicBool>) -> Result<()> {
        while running.load(Ordering::SeqCst) {
            match self.handle.wait_for_connection(Some(self.config.accept_poll)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Timeout => continue,
                Err(e) => return Err(e).context("Failed to accept client"),
            }

            tracing::info!("New client connected");
            if let Ok(creds) = self.handle.peer_credentials() {
                tracing::debug!(pid = creds.pid, uid = ?creds.uid, "Client credentials");
            }

            let session = self.handle_client();
            self.handle
                .disconnect()
                .context("Failed to release client")?;

            match session {
                Ok(Session::Finished) => tracing::info!("Client disconnected"),
                Ok(Session::Shutdown) => {
                    tracing::info!("Shutdown requested by client");
                    return Ok(());
                }
                Err(e) => tracing::error!("Client error: {:#}", e),
            }
        }

        tracing::info!("Server shutdown signal received, stopping gracefully");
        Ok(())
    }

    /// Answer request lines until the client leaves, quits or stops the server
    fn handle_client(&mut self) -> Result<Session> {
        loop {
            let line = match self
                .handle
                .read_line(self.config.max_line)
                .context("Failed to read request")?
            {
                ReadOutcome::Data(line) => line,
                ReadOutcome::Eof => return Ok(Session::Finished),
            };
            tracing::debug!("Received request: {:?}", line);

            let reply = process_command(&line);
            self.handle
                .write_line(reply.text())
                .context("Failed to send reply")?;

            match reply {
                Reply::Line(_) => {}
                Reply::Close(_) => return Ok(Session::Finished),
                Reply::Shutdown(_) => return Ok(Session::Shutdown),
            }
        }
    }

    /// Closes the listening endpoint.
    pub fn shutdown(&mut self) {
        tracing::info!("Shutting down linkpipe server...");
        self.handle.close();
    }
}

/// Executes one request line and returns the reply.
///
/// Supports: PING, status, version, echo, quit, shutdown
pub fn process_command(line: &str) -> Reply {
    let line = line.trim_end_matches('\r');
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Reply::Line("ERR empty command".to_string());
    };

    match command {
        "PING" => Reply::Line("PONG".to_string()),
        "status" => Reply::Line("OK".to_string()),
        "version" => Reply::Line(env!("CARGO_PKG_VERSION").to_string()),
        "echo" => Reply::Line(parts.collect::<Vec<_>>().join(" ")),
        "quit" => Reply::Close("BYE".to_string()),
        "shutdown" => Reply::Shutdown("BYE".to_string()),
        cmd => Reply::Line(format!("ERR unknown command: {cmd}")),
    }
}
