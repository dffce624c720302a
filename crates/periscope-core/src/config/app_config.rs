use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use super::defaults;
use crate::error::{AppError, Result};

/// Application configuration
///
/// Plain values collected from the command line or environment. Call
/// [`AppConfig::validate`] before building any listener from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Port for the monitor UI and event stream
    pub monitor_port: u16,

    /// Port for proxied traffic
    pub proxy_port: u16,

    /// Backend base URL, e.g. `http://localhost:8080`
    pub target: String,

    /// Interface both listeners bind to
    pub bind_addr: String,

    /// Directory served as the monitor UI
    pub static_dir: PathBuf,

    /// Upper bound on a single proxied exchange (seconds)
    pub upstream_timeout_secs: u64,

    /// Bytes kept per captured body leg
    pub max_body_bytes: usize,

    /// Events buffered per subscriber before dropping the oldest
    pub subscriber_buffer: usize,

    /// Origins allowed to open a monitor connection (empty allows any)
    pub allowed_origins: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            monitor_port: defaults::DEFAULT_MONITOR_PORT,
            proxy_port: defaults::DEFAULT_PROXY_PORT,
            target: defaults::DEFAULT_TARGET.to_string(),
            bind_addr: defaults::DEFAULT_BIND_ADDR.to_string(),
            static_dir: PathBuf::from(defaults::DEFAULT_STATIC_DIR),
            upstream_timeout_secs: defaults::DEFAULT_UPSTREAM_TIMEOUT_SECS,
            max_body_bytes: defaults::DEFAULT_MAX_BODY_BYTES,
            subscriber_buffer: defaults::DEFAULT_SUBSCRIBER_BUFFER,
            allowed_origins: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method for the backend target
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Builder method for both listener ports
    pub fn with_ports(mut self, proxy_port: u16, monitor_port: u16) -> Self {
        self.proxy_port = proxy_port;
        self.monitor_port = monitor_port;
        self
    }

    /// Check every value before any component is constructed
    pub fn validate(&self) -> Result<()> {
        if self.proxy_port == 0 {
            return Err(AppError::ConfigError("proxy port must be positive".into()));
        }
        if self.monitor_port == 0 {
            return Err(AppError::ConfigError(
                "monitor port must be positive".into(),
            ));
        }
        if self.proxy_port == self.monitor_port {
            return Err(AppError::ConfigError(format!(
                "proxy and monitor ports must differ (both {})",
                self.proxy_port
            )));
        }
        if self.bind_addr.trim().is_empty() {
            return Err(AppError::ConfigError("bind address is empty".into()));
        }
        self.target_url()?;
        if self.upstream_timeout_secs == 0 {
            return Err(AppError::ConfigError(
                "upstream timeout must be positive".into(),
            ));
        }
        if self.max_body_bytes == 0 {
            return Err(AppError::ConfigError(
                "body capture limit must be positive".into(),
            ));
        }
        if self.subscriber_buffer == 0 {
            return Err(AppError::ConfigError(
                "subscriber buffer must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Parsed backend URL; only absolute http(s) URLs are accepted
    pub fn target_url(&self) -> Result<Url> {
        let target = self.target.trim();
        if target.is_empty() {
            return Err(AppError::ConfigError("target URL is empty".into()));
        }
        let url = Url::parse(target)
            .map_err(|e| AppError::ConfigError(format!("invalid target URL '{target}': {e}")))?;
        match url.scheme() {
            "http" | "https" if url.has_host() => Ok(url),
            scheme => Err(AppError::ConfigError(format!(
                "target URL must be http(s) with a host, got scheme '{scheme}'"
            ))),
        }
    }

    /// Target without a trailing slash, ready for appending request paths
    pub fn target_base(&self) -> String {
        self.target.trim().trim_end_matches('/').to_string()
    }

    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.proxy_port)
    }

    pub fn monitor_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.monitor_port)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}
