//! Command-line arguments for the extension
//!
//! Every flag can also be supplied through the environment, which is how the
//! host runtime configures extensions in practice.

use clap::Parser;
use std::path::PathBuf;

use super::defaults::*;

/// Command-line arguments for the extension
#[derive(Parser, Debug, Clone)]
#[command(name = "leaf-extension")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Lifecycle extension embedding a federated pub/sub broker")]
pub struct ExtensionArgs {
    /// host:port of the lifecycle API, provided by the host runtime
    #[arg(long, env = "AWS_LAMBDA_RUNTIME_API")]
    pub runtime_api: Option<String>,

    /// Upstream broker the embedded broker federates with
    #[arg(long, env = "PEER_NATS_URL", default_value = DEFAULT_PEER_URL)]
    pub peer_url: String,

    /// Address the embedded broker listens on
    #[arg(long, env = "EXTENSION_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_addr: String,

    /// File created at startup to signal that the extension is alive
    #[arg(long, env = "EXTENSION_MARKER_PATH", default_value = DEFAULT_MARKER_PATH)]
    pub marker_path: PathBuf,

    /// Name sent in the Lambda-Extension-Name header at registration
    #[arg(long, env = "EXTENSION_NAME", default_value = DEFAULT_EXTENSION_NAME)]
    pub extension_name: String,

    /// Topic the lifecycle status messages are published on
    #[arg(long, env = "EXTENSION_TOPIC", default_value = DEFAULT_TOPIC)]
    pub topic: String,

    /// Number of attempts to connect the local client to the embedded broker
    #[arg(long, env = "EXTENSION_CONNECT_ATTEMPTS", default_value_t = DEFAULT_CONNECT_ATTEMPTS)]
    pub connect_attempts: u32,

    /// Pause between local connection attempts in milliseconds
    #[arg(long, env = "EXTENSION_CONNECT_INTERVAL_MS", default_value_t = DEFAULT_CONNECT_INTERVAL_MS)]
    pub connect_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "EXTENSION_LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    /// Log output format:
    ///   "text" - human readable lines (default)
    ///   "json" - one JSON object per line
    #[arg(long, env = "EXTENSION_LOG_FORMAT", default_value = DEFAULT_LOG_FORMAT)]
    pub log_format: String,
}

impl Default for ExtensionArgs {
    fn default() -> Self {
        Self {
            runtime_api: None,
            peer_url: DEFAULT_PEER_URL.to_string(),
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            marker_path: PathBuf::from(DEFAULT_MARKER_PATH),
            extension_name: DEFAULT_EXTENSION_NAME.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_interval_ms: DEFAULT_CONNECT_INTERVAL_MS,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse_without_flags() {
        let args = ExtensionArgs::try_parse_from(["leaf-extension", "--runtime-api", "x:1"])
            .unwrap();
        assert_eq!(args.peer_url, DEFAULT_PEER_URL);
        assert_eq!(args.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(args.connect_attempts, 50);
        assert_eq!(args.connect_interval_ms, 100);
        assert_eq!(args.topic, "lambda");
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = ExtensionArgs::try_parse_from([
            "leaf-extension",
            "--runtime-api",
            "127.0.0.1:9001",
            "--peer-url",
            "nats://hub:7422",
            "--connect-attempts",
            "3",
        ])
        .unwrap();
        assert_eq!(args.runtime_api.as_deref(), Some("127.0.0.1:9001"));
        assert_eq!(args.peer_url, "nats://hub:7422");
        assert_eq!(args.connect_attempts, 3);
    }
}
