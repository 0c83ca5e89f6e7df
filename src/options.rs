use std::time::Duration;

/// Default server host used by [`Endpoint::default`].
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default server port used by [`Endpoint::default`].
pub const DEFAULT_PORT: u16 = 8080;
/// Rows requested per `NEXT` command.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Configures pagination and timeout behavior.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientOptions {
    /// Rows requested per `NEXT`; also the threshold for "more rows available".
    /// Values below 1 are treated as 1.
    pub batch_size: usize,
    /// Timeout for establishing the TCP connection, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Timeout for one command's response frame, in milliseconds.
    /// `0` waits indefinitely.
    pub command_timeout_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            connect_timeout_ms: 5_000,
            command_timeout_ms: 10_000,
        }
    }
}

impl ClientOptions {
    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub(crate) fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_ms > 0).then(|| Duration::from_millis(self.command_timeout_ms))
    }
}

/// Server address. Supplied by the caller on every connect, never persisted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
        }
    }
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Reads the endpoint from the environment.
    ///
    /// Reads:
    /// - `DOMINO_HOST`: server host (default `127.0.0.1`)
    /// - `DOMINO_PORT`: server port (default `8080`)
    ///
    /// Returns an error if a variable is set but empty or unparsable.
    pub fn from_env() -> std::result::Result<Self, String> {
        let mut endpoint = Self::default();
        if let Ok(host) = std::env::var("DOMINO_HOST") {
            if host.trim().is_empty() {
                return Err("DOMINO_HOST is set but empty".to_owned());
            }
            endpoint.host = host.trim().to_owned();
        }
        if let Ok(port) = std::env::var("DOMINO_PORT") {
            endpoint.port = parse_port(&port)?;
        }
        Ok(endpoint)
    }
}

fn parse_port(value: &str) -> std::result::Result<u16, String> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|err| format!("DOMINO_PORT '{value}' is not a valid port: {err}"))
}
