#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # leaf-extension
//!
//! A serverless lifecycle extension that embeds a small publish/subscribe
//! broker, joins it to an upstream broker as a leaf, and publishes the
//! function's lifecycle on a topic.
//!
//! ## What it does
//!
//! - Creates a liveness marker file as soon as it starts
//! - Runs an embedded broker on loopback (`127.0.0.1:4222` by default) that
//!   speaks the core NATS text protocol, so function code can use any
//!   standard client
//! - Federates the embedded broker to `PEER_NATS_URL`: local subscriptions
//!   are mirrored upstream, local publications are forwarded upstream, and
//!   upstream messages reach local subscribers
//! - Registers with the host lifecycle API and publishes
//!   `Extension started`, `Function invoked` and `Extension shutting down`
//!   on the `lambda` topic
//!
//! ## Running
//!
//! ```bash
//! # The host runtime sets AWS_LAMBDA_RUNTIME_API
//! $ PEER_NATS_URL=nats://hub.internal:4222 ./leaf-extension
//!
//! # JSON logs
//! $ ./leaf-extension --log-format json
//! ```
//!
//! ## Library usage
//!
//! ```no_run
//! use leaf_extension::broker::{self, BrokerConfig};
//! use leaf_extension::client::{BrokerClient, RetryPolicy};
//! use leaf_extension::config::{parse_peer_url, DEFAULT_LISTEN_SOCKET_ADDR};
//! use bytes::Bytes;
//!
//! # async fn demo() -> leaf_extension::Result<()> {
//! let upstream = parse_peer_url("nats://hub:4222")?;
//! let config = BrokerConfig::new(DEFAULT_LISTEN_SOCKET_ADDR, upstream);
//! let handle = broker::start(config)?;
//! let client = BrokerClient::connect(handle.listen_addr(), &RetryPolicy::default()).await?;
//! client.publish("lambda", Bytes::from_static(b"hello")).await?;
//! client.close().await?;
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod extension;
pub mod lifecycle;
pub mod marker;

pub use bridge::{BridgeState, BridgeStats, EventBridge, EventSource, Publisher};
pub use broker::{BrokerConfig, BrokerHandle, BrokerStats, BrokerStatus, LeafState};
pub use client::{BrokerClient, Message, RetryPolicy, Subscription};
pub use config::{ExtensionArgs, ExtensionConfig, LogFormat};
pub use error::{ExtensionError, Result};
pub use lifecycle::{EventKind, ExtensionSession, LifecycleClient, LifecycleEvent};
