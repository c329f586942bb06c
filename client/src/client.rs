use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use linkpipe_common::{config, make_name, IpcHandle, ReadOutcome};

/// Reply prefix the server uses for failed requests
const ERROR_PREFIX: &str = "ERR ";

/// Configuration for the linkpipe client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Full transport name to connect to
    pub name:     String,
    /// How long to wait for each reply
    pub timeout:  Duration,
    /// Longest reply line read at once
    pub max_line: usize,
    /// Enable verbose logging
    pub verbose:  bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name:     default_name(config::default_channel()),
            timeout:  Duration::from_secs(30),
            max_line: 4096,
            verbose:  false,
        }
    }
}

/// Native name for `channel`; an invalid channel is kept as-is so it surfaces
/// as a connection error naming it
fn default_name(channel: String) -> String {
    match make_name(&channel) {
        Ok(name) => name,
        Err(e) => {
            tracing::warn!(
                "Invalid {} value {:?}, using it unchanged: {}",
                config::CHANNEL_ENV,
                channel,
                e
            );
            channel
        }
    }
}

impl ClientConfig {
    /// Creates a client configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to the native name derived from a simple channel name
    pub fn with_channel(mut self, channel: &str) -> Result<Self> {
        self.name =
            make_name(channel).with_context(|| format!("Invalid channel name: {channel}"))?;
        Ok(self)
    }

    /// Connect to an already resolved transport name
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Set the reply timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the reply line capacity
    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }

    /// Enable verbose logging
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// A request/reply client for the line server
pub struct IpcClient {
    name:            String,
    connection:      Option<IpcHandle>,
    request_counter: u32,
    timeout:         Duration,
    max_line:        usize,
    verbose:         bool,
}

impl IpcClient {
    /// Creates an unconnected client from configuration
    pub fn new(config: ClientConfig) -> Self {
        Self {
            name:            config.name,
            connection:      None,
            request_counter: 0,
            timeout:         config.timeout,
            max_line:        config.max_line,
            verbose:         config.verbose,
        }
    }

    /// Creates a client with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ClientConfig::default())
    }

    /// Connect to the server
    pub fn connect(&mut self) -> Result<()> {
        self.log(format_args!("Connecting to linkpipe server: {}", self.name));

        let mut handle = IpcHandle::connect_client(&self.name)
            .with_context(|| format!("Failed to connect to server: {}", self.name))?;
        if !self.timeout.is_zero() {
            handle
                .set_read_timeout(Some(self.timeout))
                .context("Failed to set reply timeout")?;
        }
        self.connection = Some(handle);

        self.log(format_args!("✓ Connected"));
        Ok(())
    }

    /// Disconnect from the server
    pub fn disconnect(&mut self) -> Result<()> {
        if let Some(mut handle) = self.connection.take() {
            self.log(format_args!("Disconnecting from server..."));
            handle.close();
            self.log(format_args!("✓ Disconnected"));
        }
        Ok(())
    }

    /// Check if client is connected to the server
    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|handle| handle.is_connected())
    }

    /// Send `PING` and wait for `PONG`
    pub fn ping(&mut self) -> Result<()> {
        self.log(format_args!("Sending ping..."));
        match self.exchange("PING")?.as_str() {
            "PONG" => {
                self.log(format_args!("✓ Received pong"));
                Ok(())
            }
            other => Err(anyhow!("Expected PONG, got: {:?}", other)),
        }
    }

    /// Send a command line and return the server's reply.
    ///
    /// Replies starting with `ERR ` become errors.
    pub fn send_request(&mut self, command: &str) -> Result<String> {
        if command.contains('\n') {
            bail!("Request must be a single line");
        }

        self.request_counter += 1;
        let request_id = self.request_counter;
        self.log(format_args!("Sending request {request_id}: {command}"));

        let reply = self.exchange(command)?;
        match reply.strip_prefix(ERROR_PREFIX) {
            Some(message) => Err(anyhow!("Request {} error: {}", request_id, message)),
            None => {
                self.log(format_args!("✓ Request {request_id} completed successfully"));
                Ok(reply)
            }
        }
    }

    /// Ask the server to stop; the connection is dropped afterwards
    pub fn shutdown_server(&mut self) -> Result<()> {
        self.log(format_args!("Sending shutdown command..."));
        let result = self.exchange("shutdown").map(|_| ());
        self.disconnect()?;
        result?;
        self.log(format_args!("✓ Shutdown command sent"));
        Ok(())
    }

    /// Get connection and usage statistics
    pub fn get_stats(&self) -> ClientStats {
        ClientStats {
            connected:     self.is_connected(),
            name:          self.name.clone(),
            requests_sent: self.request_counter,
            timeout:       self.timeout,
        }
    }

    /// Write one request line and read one reply line
    fn exchange(&mut self, line: &str) -> Result<String> {
        let max_line = self.max_line;
        let handle = self
            .connection
            .as_mut()
            .ok_or_else(|| anyhow!("Not connected to server"))?;

        handle.write_line(line).context("Failed to send request")?;
        match handle
            .read_line(max_line)
            .context("Failed to receive reply")?
        {
            ReadOutcome::Data(reply) => Ok(reply),
            ReadOutcome::Eof => Err(anyhow!("Server closed the connection")),
        }
    }

    fn log(&self, message: std::fmt::Arguments<'_>) {
        if self.verbose {
            tracing::info!("{}", message);
        } else {
            tracing::debug!("{}", message);
        }
    }
}

/// Statistics about the client connection
#[derive(Debug, Clone)]
pub struct ClientStats {
    pub connected:     bool,
    pub name:          String,
    pub requests_sent: u32,
    pub timeout:       Duration,
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        if self.connection.is_some() {
            let _ = self.disconnect();
        }
    }
}

// Convenience functions for common operations
impl IpcClient {
    /// Execute a single command (connect, execute, disconnect)
    pub fn execute_command(config: ClientConfig, command: &str) -> Result<String> {
        let mut client = Self::new(config);
        client.connect()?;
        let result = client.send_request(command);
        client.disconnect()?;
        result
    }

    /// Quick ping test (connect, ping, disconnect)
    pub fn quick_ping(config: ClientConfig) -> Result<()> {
        let mut client = Self::new(config);

        client.connect()?;
        let result = client.ping();
        client.disconnect()?;

        result
    }
}
