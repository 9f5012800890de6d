//! Session configuration.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration snapshot. Immutable after startup; the session
/// takes it by `Arc` at construction.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Origin server the session connects to.
    pub backend: BackendConfig,

    /// Optional HTTP proxy to CONNECT through before reaching the origin.
    #[serde(default)]
    pub http_proxy: Option<HttpProxyConfig>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// The origin address in use (first configured node).
    pub fn backend_addr(&self) -> SocketAddr {
        self.backend.nodes[0]
    }

    /// Host name of the origin, for the CONNECT Host header and SNI.
    pub fn backend_host(&self) -> String {
        self.backend
            .host
            .clone()
            .unwrap_or_else(|| self.backend_addr().ip().to_string())
    }

    /// `host:port` target for the CONNECT request line.
    pub fn backend_hostport(&self) -> String {
        format!("{}:{}", self.backend_host(), self.backend_addr().port())
    }

    /// Name presented in the TLS SNI extension.
    pub fn sni_name(&self) -> String {
        self.backend
            .sni
            .clone()
            .unwrap_or_else(|| self.backend_host())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.write_timeout_ms)
    }

    pub fn settings_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.http2.settings_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.backend.http2.health_check_interval_ms)
    }
}

/// Origin server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Origin addresses; the first entry is used.
    pub nodes: Vec<SocketAddr>,

    /// Host name of the origin (defaults to the node's IP literal).
    pub host: Option<String>,

    /// Connect with TLS (ALPN "h2").
    #[serde(default)]
    pub tls: bool,

    /// Skip peer certificate verification.
    #[serde(default)]
    pub insecure: bool,

    /// Override the SNI name sent during the TLS handshake.
    pub sni: Option<String>,

    /// Read timeout in milliseconds.
    #[serde(default = "BackendConfig::default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Write timeout in milliseconds.
    #[serde(default = "BackendConfig::default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// HTTP/2 tuning.
    #[serde(default)]
    pub http2: Http2Config,
}

impl BackendConfig {
    fn default_read_timeout_ms() -> u64 {
        30_000
    }

    fn default_write_timeout_ms() -> u64 {
        30_000
    }
}

/// HTTP/2 protocol tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct Http2Config {
    /// Per-stream receive window is (1 << window_bits) - 1.
    #[serde(default = "Http2Config::default_window_bits")]
    pub window_bits: u8,

    /// Connection receive window is (1 << connection_window_bits) - 1.
    /// Values above 16 submit a connection WINDOW_UPDATE on connect.
    #[serde(default = "Http2Config::default_window_bits")]
    pub connection_window_bits: u8,

    /// SETTINGS_MAX_CONCURRENT_STREAMS we advertise.
    #[serde(default = "Http2Config::default_max_concurrent_streams")]
    pub max_concurrent_streams: u32,

    /// Pad outgoing DATA frames.
    #[serde(default)]
    pub padding: bool,

    /// SETTINGS ACK timeout in milliseconds.
    #[serde(default = "Http2Config::default_settings_timeout_ms")]
    pub settings_timeout_ms: u64,

    /// Idle interval before a connection health check is required.
    #[serde(default = "Http2Config::default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self {
            window_bits: Self::default_window_bits(),
            connection_window_bits: Self::default_window_bits(),
            max_concurrent_streams: Self::default_max_concurrent_streams(),
            padding: false,
            settings_timeout_ms: Self::default_settings_timeout_ms(),
            health_check_interval_ms: Self::default_health_check_interval_ms(),
        }
    }
}

impl Http2Config {
    fn default_window_bits() -> u8 {
        16
    }

    fn default_max_concurrent_streams() -> u32 {
        100
    }

    fn default_settings_timeout_ms() -> u64 {
        10_000
    }

    fn default_health_check_interval_ms() -> u64 {
        5_000
    }
}

/// Upstream HTTP proxy used for CONNECT tunneling.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpProxyConfig {
    /// Address of the proxy.
    pub addr: SocketAddr,

    /// `user:pass` for Proxy-Authorization: Basic.
    pub userinfo: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Log format: "pretty", "json", or "compact".
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: Self::default_format(),
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_format() -> String {
        "pretty".to_string()
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
