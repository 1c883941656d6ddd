//! Default constants for extension configuration
//!
//! These constants define the values used when neither a flag nor an
//! environment variable provides one.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default locator of the upstream peer broker
pub const DEFAULT_PEER_URL: &str = "nats://localhost:4222";

/// Default bind address of the embedded broker
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:4222";

/// Default embedded broker socket address (const, no parsing needed)
pub const DEFAULT_LISTEN_SOCKET_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 4222);

/// Default liveness marker path
pub const DEFAULT_MARKER_PATH: &str = "/tmp/nats-extension.lock";

/// Default extension name sent at registration
pub const DEFAULT_EXTENSION_NAME: &str = "nats-extension";

/// Default topic carrying lifecycle status messages
pub const DEFAULT_TOPIC: &str = "lambda";

/// Default number of local client connection attempts
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 50;

/// Default pause between local client connection attempts in milliseconds
pub const DEFAULT_CONNECT_INTERVAL_MS: u64 = 100;

/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default log format ("text" or "json")
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Path prefix of the lifecycle extension API
pub const EVENTS_PATH: &str = "/2020-01-01/extension";

/// Status published once registration succeeds
pub const STARTED_MESSAGE: &str = "Extension started";

/// Status published for every INVOKE event
pub const INVOKED_MESSAGE: &str = "Function invoked";

/// Status published for the SHUTDOWN event
pub const SHUTTING_DOWN_MESSAGE: &str = "Extension shutting down";

/// Largest payload the embedded broker accepts (1 MiB)
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Pause between attempts of the leaf link to reach the upstream peer
pub const DEFAULT_LEAF_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on how long broker shutdown waits for the accept task
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
