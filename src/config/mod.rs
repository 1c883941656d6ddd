//! Configuration module for the extension
//!
//! This module is organized into submodules:
//! - `defaults` - Default constants and fixed protocol values
//! - `args` - CLI argument definitions (each flag is also an env variable)
//!
//! [`ExtensionConfig`] is built once at process start from [`ExtensionArgs`],
//! validated, and then handed by reference to every component. Nothing reads
//! the environment after that point.

mod args;
mod defaults;

pub use args::ExtensionArgs;
pub use defaults::*;

use crate::broker::BrokerConfig;
use crate::client::RetryPolicy;
use crate::error::{ExtensionError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Schemes accepted for the upstream peer locator
const PEER_SCHEMES: &[&str] = &["nats", "tcp"];

/// Port assumed when the upstream locator does not name one
pub const DEFAULT_PEER_PORT: u16 = 4222;

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!(
                "Invalid log format '{}'. Valid options: text, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Status strings published on the lifecycle topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessages {
    pub started: String,
    pub invoked: String,
    pub shutting_down: String,
}

impl Default for StatusMessages {
    fn default() -> Self {
        Self {
            started: STARTED_MESSAGE.to_string(),
            invoked: INVOKED_MESSAGE.to_string(),
            shutting_down: SHUTTING_DOWN_MESSAGE.to_string(),
        }
    }
}

/// Complete, immutable configuration of one extension process.
#[derive(Debug, Clone)]
pub struct ExtensionConfig {
    /// host:port (or full base URL) of the lifecycle API
    pub runtime_api: String,
    /// Name sent at registration
    pub extension_name: String,
    /// Path prefix of the lifecycle extension API
    pub events_path: String,
    /// Topic the status messages are published on
    pub topic: String,
    /// Status message payloads
    pub messages: StatusMessages,
    /// Embedded broker settings
    pub broker: BrokerConfig,
    /// Local client connection retry bound
    pub retry: RetryPolicy,
    /// Liveness marker location
    pub marker_path: PathBuf,
    /// Fallback log level when RUST_LOG is unset
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl ExtensionConfig {
    /// Build the configuration from parsed arguments.
    pub fn from_args(args: ExtensionArgs) -> Result<Self> {
        let runtime_api = args
            .runtime_api
            .map(|api| api.trim().to_string())
            .filter(|api| !api.is_empty())
            .ok_or_else(|| ExtensionError::config_missing("AWS_LAMBDA_RUNTIME_API"))?;

        let listen_addr: SocketAddr = args.listen_addr.parse().map_err(|e| {
            ExtensionError::config("listen_addr", format!("invalid address: {}", e))
        })?;

        let upstream = parse_peer_url(&args.peer_url)?;

        let log_format = args
            .log_format
            .parse::<LogFormat>()
            .map_err(|e| ExtensionError::config("log_format", e))?;

        Ok(Self {
            runtime_api,
            extension_name: args.extension_name,
            events_path: EVENTS_PATH.to_string(),
            topic: args.topic,
            messages: StatusMessages::default(),
            broker: BrokerConfig::new(listen_addr, upstream),
            retry: RetryPolicy::new(
                args.connect_attempts,
                Duration::from_millis(args.connect_interval_ms),
            ),
            marker_path: args.marker_path,
            log_level: args.log_level,
            log_format,
        })
    }

    /// Validate the configuration before any component starts.
    pub fn validate(&self) -> Result<()> {
        if self.broker.listen_addr.port() == 0 {
            return Err(ExtensionError::config(
                "listen_addr",
                "port must be between 1 and 65535",
            ));
        }

        if self.extension_name.trim().is_empty() {
            return Err(ExtensionError::config_missing("extension name"));
        }

        crate::broker::subject::validate_literal(&self.topic)
            .map_err(|reason| ExtensionError::config("topic", reason))?;

        if self.retry.max_attempts == 0 {
            return Err(ExtensionError::config(
                "connect_attempts",
                "at least one attempt is required",
            ));
        }

        if self.marker_path.as_os_str().is_empty() {
            return Err(ExtensionError::config_missing("marker path"));
        }

        Ok(())
    }

    /// Base URL of the lifecycle extension API, e.g. `http://host:9001/2020-01-01/extension`.
    pub fn lifecycle_base_url(&self) -> String {
        let host = self.runtime_api.trim_end_matches('/');
        if host.contains("://") {
            format!("{}{}", host, self.events_path)
        } else {
            format!("http://{}{}", host, self.events_path)
        }
    }

    /// Address the local client dials to reach the embedded broker.
    pub fn local_broker_addr(&self) -> SocketAddr {
        self.broker.listen_addr
    }
}

/// Parse the upstream peer locator.
///
/// A bare `host:port` is accepted and treated as `nats://host:port`.
pub fn parse_peer_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ExtensionError::config_missing("PEER_NATS_URL"));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("nats://{}", trimmed)
    };

    let url = Url::parse(&candidate)
        .map_err(|e| ExtensionError::config("peer_url", format!("'{}': {}", raw, e)))?;

    if !PEER_SCHEMES.contains(&url.scheme()) {
        return Err(ExtensionError::config(
            "peer_url",
            format!(
                "unsupported scheme '{}'. Valid options: {}",
                url.scheme(),
                PEER_SCHEMES.join(", ")
            ),
        ));
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url),
        _ => Err(ExtensionError::config(
            "peer_url",
            format!("'{}' does not name a host", raw),
        )),
    }
}

/// `host:port` of a parsed peer locator, defaulting the port.
pub fn peer_target(url: &Url) -> String {
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(DEFAULT_PEER_PORT);
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
