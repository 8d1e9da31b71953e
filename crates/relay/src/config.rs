//! Process configuration, read from the environment.

use crate::error::{RelayError, Result};
use std::path::PathBuf;
use tracing::info;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8000;

/// Default broker URL.
pub const DEFAULT_BROKER_URL: &str = "redis://localhost:6379";

/// Default name of the cookie carrying the session token.
pub const DEFAULT_SESSION_COOKIE: &str = "session";

/// Default path of the page served to non-upgrade requests.
pub const DEFAULT_STATIC_PAGE: &str = "static/ws.html";

/// Default outbound queue size per connection.
pub const DEFAULT_CLIENT_BUFFER_SIZE: usize = 256;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// HTTP/WebSocket listen port (`PORT`).
    pub port: u16,
    /// Broker URL (`BROKER_URL`); the scheme picks the backend.
    pub broker_url: String,
    /// Session cookie name (`SESSION_COOKIE`).
    pub session_cookie: String,
    /// Static page file (`STATIC_PAGE`).
    pub static_page: PathBuf,
    /// Prometheus exporter port (`METRICS_PORT`); no exporter when unset.
    pub metrics_port: Option<u16>,
    /// Outbound queue size per connection (`CLIENT_BUFFER_SIZE`).
    pub client_buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            broker_url: DEFAULT_BROKER_URL.to_string(),
            session_cookie: DEFAULT_SESSION_COOKIE.to_string(),
            static_page: PathBuf::from(DEFAULT_STATIC_PAGE),
            metrics_port: None,
            client_buffer_size: DEFAULT_CLIENT_BUFFER_SIZE,
        }
    }
}

impl RelayConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through a key lookup; unset keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = parse_var(&lookup, "PORT")?.unwrap_or(defaults.port);
        let metrics_port = parse_var(&lookup, "METRICS_PORT")?;
        let client_buffer_size =
            parse_var(&lookup, "CLIENT_BUFFER_SIZE")?.unwrap_or(defaults.client_buffer_size);
        if client_buffer_size == 0 {
            return Err(RelayError::Config(
                "CLIENT_BUFFER_SIZE must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            port,
            broker_url: lookup("BROKER_URL").unwrap_or(defaults.broker_url),
            session_cookie: lookup("SESSION_COOKIE").unwrap_or(defaults.session_cookie),
            static_page: lookup("STATIC_PAGE")
                .map(PathBuf::from)
                .unwrap_or(defaults.static_page),
            metrics_port,
            client_buffer_size,
        })
    }

    /// Log the effective configuration.
    pub fn log(&self) {
        info!("Configuration:");
        info!("  PORT: {}", self.port);
        info!("  BROKER_URL: {}", self.broker_url);
        info!("  SESSION_COOKIE: {}", self.session_cookie);
        info!("  STATIC_PAGE: {}", self.static_page.display());
        match self.metrics_port {
            Some(port) => info!("  METRICS_PORT: {}", port),
            None => info!("  METRICS_PORT: (disabled)"),
        }
        info!("  CLIENT_BUFFER_SIZE: {}", self.client_buffer_size);
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RelayError::Config(format!("{} must be a number, got '{}'", key, raw))),
        None => Ok(None),
    }
}
