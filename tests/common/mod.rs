//! Shared test fixtures and utilities for the extension integration tests
//!
//! # Usage
//!
//! In your test file, add:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```
//!
//! # Features
//!
//! - Port allocation utilities
//! - Embedded broker fixtures
//! - `RawClient`: speaks the text protocol line by line
//! - `LifecycleMock`: scripted lifecycle API built on wiremock

#![allow(dead_code)]

use leaf_extension::broker::{self, BrokerConfig, BrokerHandle};
use leaf_extension::config::{ExtensionArgs, ExtensionConfig};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Path prefix of the lifecycle extension API
pub const EVENTS_PATH: &str = "/2020-01-01/extension";

/// How long tests wait for a single asynchronous effect
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Network Utilities
// ============================================================================

/// Find an available TCP port for testing
///
/// Binds to port 0 and returns the OS-assigned port number.
/// The port is released when the function returns, so there's a small
/// window where another process could claim it.
pub fn find_available_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to port 0");
    listener
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

/// Locator of a port nothing listens on
pub fn unreachable_peer() -> Url {
    Url::parse(&format!("nats://127.0.0.1:{}", find_available_port())).unwrap()
}

// ============================================================================
// Broker Fixtures
// ============================================================================

/// Broker config on an ephemeral port with a fast leaf reconnect
pub fn broker_config(upstream: Url) -> BrokerConfig {
    let mut config = BrokerConfig::new("127.0.0.1:0".parse().unwrap(), upstream);
    config.leaf_reconnect_interval = Duration::from_millis(50);
    config
}

/// Start a broker and wait until it accepts connections
pub async fn start_broker(upstream: Url) -> (BrokerHandle, SocketAddr) {
    let handle = broker::start(broker_config(upstream)).expect("Failed to start broker");
    let addr = tokio::time::timeout(TEST_TIMEOUT, handle.ready())
        .await
        .expect("Broker did not become ready")
        .expect("Broker failed to start");
    (handle, addr)
}

/// Poll `check` until it holds or the test timeout elapses
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ============================================================================
// Raw Protocol Client
// ============================================================================

/// Line-level protocol client for asserting exact frames
pub struct RawClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RawClient {
    /// Connect and consume the INFO line
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
        };
        let info = client.read_line().await;
        assert!(info.starts_with("INFO "), "expected INFO, got {info:?}");
        client
    }

    pub async fn send(&mut self, data: &str) {
        self.writer
            .write_all(data.as_bytes())
            .await
            .expect("Failed to write");
    }

    /// Next line including its terminator; empty at EOF
    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(TEST_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("Timed out waiting for a line")
            .expect("Failed to read");
        line
    }

    /// Send PING and wait for PONG so earlier operations are applied
    pub async fn sync(&mut self) {
        self.send("PING\r\n").await;
        loop {
            let line = self.read_line().await;
            if line == "PONG\r\n" {
                return;
            }
            assert!(!line.is_empty(), "connection closed before PONG");
        }
    }

    /// Read one MSG frame and return (control line, payload line)
    pub async fn read_msg(&mut self) -> (String, String) {
        let control = self.read_line().await;
        assert!(control.starts_with("MSG "), "expected MSG, got {control:?}");
        let payload = self.read_line().await;
        (control, payload)
    }
}

// ============================================================================
// Lifecycle API Mock
// ============================================================================

/// Replays scripted responses in order; answers 500 once exhausted
pub struct ScriptedResponder {
    responses: Mutex<VecDeque<ResponseTemplate>>,
}

impl ScriptedResponder {
    pub fn new(responses: Vec<ResponseTemplate>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }
}

impl Respond for ScriptedResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| ResponseTemplate::new(500).set_body_string("script exhausted"))
    }
}

/// Response carrying one event of `event_type`
pub fn event_response(event_type: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "eventType": event_type,
        "deadlineMs": 1_700_000_000_000u64,
        "requestId": "req-1",
    }))
}

/// Mock lifecycle API
pub struct LifecycleMock {
    pub server: MockServer,
}

impl LifecycleMock {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// `host:port` as the host runtime would export it
    pub fn runtime_api(&self) -> String {
        self.server.address().to_string()
    }

    /// Successful registration returning `id`, answered after `delay`
    pub async fn register_ok(&self, id: &str, delay: Duration) {
        Mock::given(method("POST"))
            .and(path(format!("{}/register", EVENTS_PATH)))
            .and(header("Lambda-Extension-Name", "nats-extension"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Lambda-Extension-Identifier", id)
                    .set_body_json(serde_json::json!({
                        "functionName": "hello-from-lambda",
                        "functionVersion": "$LATEST",
                        "handler": "index.handler",
                    }))
                    .set_delay(delay),
            )
            .expect(1)
            .mount(&self.server)
            .await;
    }

    pub async fn register_status(&self, status: u16) {
        Mock::given(method("POST"))
            .and(path(format!("{}/register", EVENTS_PATH)))
            .respond_with(ResponseTemplate::new(status).set_body_string("registration refused"))
            .expect(1)
            .mount(&self.server)
            .await;
    }

    /// Serve `responses` to successive polls carrying session `id`; exactly
    /// that many polls are expected.
    pub async fn events(&self, id: &str, responses: Vec<ResponseTemplate>) {
        let count = responses.len() as u64;
        Mock::given(method("GET"))
            .and(path(format!("{}/event/next", EVENTS_PATH)))
            .and(header("Lambda-Extension-Identifier", id))
            .respond_with(ScriptedResponder::new(responses))
            .expect(count)
            .mount(&self.server)
            .await;
    }
}

/// Extension config pointed at `mock`, with a free broker port, the marker
/// under `dir`, and an upstream nothing listens on
pub fn extension_config(mock: &LifecycleMock, dir: &Path) -> ExtensionConfig {
    let args = ExtensionArgs {
        runtime_api: Some(mock.runtime_api()),
        peer_url: unreachable_peer().to_string(),
        listen_addr: format!("127.0.0.1:{}", find_available_port()),
        marker_path: dir.join("nats-extension.lock"),
        connect_attempts: 50,
        connect_interval_ms: 20,
        ..Default::default()
    };
    let config = ExtensionConfig::from_args(args).expect("Invalid test config");
    config.validate().expect("Invalid test config");
    config
}
