//! Server and client configuration.
//!
//! Defaults match the stock deployment (bridge 6969, channel 7979, shared
//! secret "password"). Environment variables override defaults, and the
//! binary's flags override both.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_BRIDGE_PORT: u16 = 6969;
pub const DEFAULT_CHANNEL_PORT: u16 = 7979;
pub const DEFAULT_PASSWORD: &str = "password";
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(3_000);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub bridge_port: u16,
    pub channel_port: u16,
    pub password: String,
    /// Window after connect in which the peer must authenticate.
    pub auth_timeout: Duration,
    pub max_frame_length: usize,
    /// Close authenticated bridges on malformed records instead of logging them.
    pub strict_after_auth: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            bridge_port: DEFAULT_BRIDGE_PORT,
            channel_port: DEFAULT_CHANNEL_PORT,
            password: DEFAULT_PASSWORD.to_string(),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            strict_after_auth: false,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (environment, file, test map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(host) = lookup("BRIDGELET_HOST") {
            config.host = host;
        }
        if let Some(port) = parse_var(&lookup, "BRIDGELET_BRIDGE_PORT")? {
            config.bridge_port = port;
        }
        if let Some(port) = parse_var(&lookup, "BRIDGELET_CHANNEL_PORT")? {
            config.channel_port = port;
        }
        if let Some(password) = lookup("BRIDGELET_PASSWORD") {
            config.password = password;
        }
        if let Some(millis) = parse_var::<u64>(&lookup, "BRIDGELET_AUTH_TIMEOUT_MS")? {
            config.auth_timeout = Duration::from_millis(millis);
        }
        if let Some(bytes) = parse_var(&lookup, "BRIDGELET_MAX_FRAME_BYTES")? {
            config.max_frame_length = bytes;
        }
        if let Some(raw) = lookup("BRIDGELET_STRICT_AFTER_AUTH") {
            config.strict_after_auth = parse_flag("BRIDGELET_STRICT_AFTER_AUTH", &raw)?;
        }

        Ok(config)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_bridge_port(mut self, port: u16) -> Self {
        self.bridge_port = port;
        self
    }

    pub fn with_channel_port(mut self, port: u16) -> Self {
        self.channel_port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn with_max_frame_length(mut self, bytes: usize) -> Self {
        self.max_frame_length = bytes;
        self
    }

    pub fn with_strict_after_auth(mut self, strict: bool) -> Self {
        self.strict_after_auth = strict;
        self
    }

    pub fn bridge_addr(&self) -> Result<SocketAddr, ConfigError> {
        socket_addr(&self.host, self.bridge_port)
    }

    pub fn channel_addr(&self) -> Result<SocketAddr, ConfigError> {
        socket_addr(&self.host, self.channel_port)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    /// Reconnect while disconnected instead of exiting after one connection.
    pub auto_connect: bool,
    pub retry_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_BRIDGE_PORT,
            password: DEFAULT_PASSWORD.to_string(),
            auto_connect: true,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(host) = lookup("BRIDGELET_CONNECT_HOST") {
            config.host = host;
        }
        if let Some(port) = parse_var(&lookup, "BRIDGELET_BRIDGE_PORT")? {
            config.port = port;
        }
        if let Some(password) = lookup("BRIDGELET_PASSWORD") {
            config.password = password;
        }
        if let Some(raw) = lookup("BRIDGELET_AUTO_CONNECT") {
            config.auto_connect = parse_flag("BRIDGELET_AUTO_CONNECT", &raw)?;
        }
        if let Some(millis) = parse_var::<u64>(&lookup, "BRIDGELET_RETRY_INTERVAL_MS")? {
            config.retry_interval = Duration::from_millis(millis);
        }

        Ok(config)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// `host:port` as accepted by `TcpStream::connect` (host names allowed).
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let raw = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    raw.parse().map_err(|_| ConfigError::InvalidAddress(raw))
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let parsed = raw.trim().parse::<T>();
    match parsed {
        Ok(value) => Ok(Some(value)),
        Err(e) => Err(ConfigError::InvalidValue {
            key,
            reason: e.to_string(),
            value: raw,
        }),
    }
}

fn parse_flag(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}
