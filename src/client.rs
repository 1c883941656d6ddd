//! Client connection to the embedded broker
//!
//! [`BrokerClient::connect`] is where broker readiness is established: the
//! broker is started without waiting for its listener, and the client keeps
//! dialing on a fixed interval until a full handshake succeeds or the
//! attempt bound is reached.

use crate::broker::protocol::{self, ConnectInfo, FrameReader, ServerInfo, ServerOp};
use crate::broker::subject;
use crate::config::{DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_INTERVAL_MS};
use crate::error::{ExtensionError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound on a single connection attempt (dial, INFO, CONNECT, PONG)
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded, fixed-interval retry of the initial connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Pause after each failed attempt except the last
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Longest time a failing connect can take, ignoring attempt duration
    pub fn total_wait(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_CONNECT_ATTEMPTS,
            Duration::from_millis(DEFAULT_CONNECT_INTERVAL_MS),
        )
    }
}

/// A message delivered to a [`Subscription`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
}

/// State shared between the client handle and its reader task
struct Shared {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    connected: AtomicBool,
    subscriptions: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
    pending_pongs: Mutex<VecDeque<oneshot::Sender<()>>>,
}

impl Shared {
    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.subscriptions.lock().clear();
        self.pending_pongs.lock().clear();
    }

    async fn write(&self, frame: &[u8]) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ExtensionError::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(frame).await {
            self.disconnect();
            return Err(e.into());
        }
        Ok(())
    }
}

struct ClientInner {
    shared: Arc<Shared>,
    addr: SocketAddr,
    server_info: ServerInfo,
    next_sid: AtomicU64,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

/// Connection to the embedded broker. Cloning shares the connection.
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<ClientInner>,
}

impl BrokerClient {
    /// Connect with bounded retry.
    ///
    /// Sleeps `policy.interval` between failed attempts and not after the
    /// last one. When every attempt fails the error names the attempt count
    /// and the last underlying failure.
    pub async fn connect(addr: SocketAddr, policy: &RetryPolicy) -> Result<Self> {
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=policy.max_attempts {
            match tokio::time::timeout(ATTEMPT_TIMEOUT, Self::try_connect(addr)).await {
                Ok(Ok(client)) => {
                    info!(addr = %addr, attempt, "Connected to embedded broker");
                    return Ok(client);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "connection attempt timed out".to_string(),
            }

            debug!(
                addr = %addr,
                attempt,
                max_attempts = policy.max_attempts,
                error = %last_error,
                "Broker connection attempt failed"
            );
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.interval).await;
            }
        }

        Err(ExtensionError::ConnectRetriesExhausted {
            attempts: policy.max_attempts,
            last_error,
        })
    }

    /// One attempt: dial, read INFO, send CONNECT and PING, await PONG.
    async fn try_connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, mut writer) = stream.into_split();
        let mut frames = FrameReader::new(reader);

        let server_info = match next_op(&mut frames).await? {
            ServerOp::Info(info) => info,
            other => {
                return Err(ExtensionError::protocol(
                    "handshake",
                    format!("expected INFO, got {:?}", other),
                ))
            }
        };

        frames.set_max_payload(server_info.max_payload);

        let connect = ConnectInfo {
            name: Some(env!("CARGO_PKG_NAME").to_string()),
            ..Default::default()
        };
        writer.write_all(&protocol::encode_connect(&connect)?).await?;
        writer.write_all(protocol::PING).await?;

        loop {
            match next_op(&mut frames).await? {
                ServerOp::Pong => break,
                ServerOp::Ping => writer.write_all(protocol::PONG).await?,
                ServerOp::Err(message) => {
                    return Err(ExtensionError::protocol("handshake", message));
                }
                ServerOp::Ok | ServerOp::Info(_) => {}
                ServerOp::Msg { .. } => {
                    return Err(ExtensionError::protocol(
                        "handshake",
                        "unexpected MSG before PONG",
                    ));
                }
            }
        }

        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(writer),
            connected: AtomicBool::new(true),
            subscriptions: Mutex::new(HashMap::new()),
            pending_pongs: Mutex::new(VecDeque::new()),
        });
        let reader = tokio::spawn(read_loop(frames, shared.clone()));

        Ok(Self {
            inner: Arc::new(ClientInner {
                shared,
                addr,
                server_info,
                next_sid: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                reader: Mutex::new(Some(reader)),
            }),
        })
    }

    /// Publish `payload` on `subject`.
    pub async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        subject::validate_literal(subject)
            .map_err(|reason| ExtensionError::protocol("publish", reason))?;
        let max = self.inner.server_info.max_payload;
        if max > 0 && payload.len() > max {
            return Err(ExtensionError::protocol(
                "publish",
                format!("payload of {} bytes exceeds maximum of {}", payload.len(), max),
            ));
        }
        self.inner
            .shared
            .write(&protocol::encode_pub(subject, None, &payload))
            .await
    }

    /// Subscribe to a subject filter.
    pub async fn subscribe(&self, filter: &str) -> Result<Subscription> {
        self.ensure_open()?;
        subject::validate_filter(filter)
            .map_err(|reason| ExtensionError::protocol("subscribe", reason))?;

        let sid = self.inner.next_sid.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.shared.subscriptions.lock().insert(sid.clone(), tx);

        if let Err(e) = self
            .inner
            .shared
            .write(&protocol::encode_sub(filter, None, &sid))
            .await
        {
            self.inner.shared.subscriptions.lock().remove(&sid);
            return Err(e);
        }

        Ok(Subscription {
            sid,
            subject: filter.to_string(),
            rx,
            shared: Arc::downgrade(&self.inner.shared),
        })
    }

    /// Round-trip a PING so everything written so far has been processed.
    pub async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        {
            let mut writer = self.inner.shared.writer.lock().await;
            self.inner.shared.pending_pongs.lock().push_back(tx);
            if let Err(e) = writer.write_all(protocol::PING).await {
                drop(writer);
                self.inner.shared.disconnect();
                return Err(e.into());
            }
        }
        rx.await.map_err(|_| ExtensionError::NotConnected)
    }

    /// Close the connection. Later calls do nothing.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let was_connected = self.inner.shared.connected.load(Ordering::SeqCst);
        self.inner.shared.disconnect();
        if was_connected {
            let mut writer = self.inner.shared.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "Broker connection shutdown failed");
            }
        }
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }

        info!(addr = %self.inner.addr, "Broker client closed");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
            && self.inner.shared.connected.load(Ordering::SeqCst)
    }

    /// INFO sent by the broker during the handshake
    pub fn server_info(&self) -> &ServerInfo {
        &self.inner.server_info
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ExtensionError::NotConnected)
        }
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("addr", &self.inner.addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Stream of messages for one subscription
pub struct Subscription {
    sid: String,
    subject: String,
    rx: mpsc::UnboundedReceiver<Message>,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Next message, or `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Stop the subscription on the broker.
    pub async fn unsubscribe(self) -> Result<()> {
        let shared = self.shared.upgrade().ok_or(ExtensionError::NotConnected)?;
        shared.subscriptions.lock().remove(&self.sid);
        shared.write(&protocol::encode_unsub(&self.sid, None)).await
    }
}

async fn next_op(frames: &mut FrameReader<OwnedReadHalf>) -> Result<ServerOp> {
    let line = frames
        .next_line()
        .await?
        .ok_or_else(|| ExtensionError::broker_connection("connection closed by broker"))?;
    protocol::parse_server_op(&line).map_err(|e| ExtensionError::protocol("parse", e))
}

/// Dispatch broker traffic until the connection ends.
async fn read_loop(mut frames: FrameReader<OwnedReadHalf>, shared: Arc<Shared>) {
    loop {
        let op = match next_op(&mut frames).await {
            Ok(op) => op,
            Err(e) => {
                if shared.connected.load(Ordering::SeqCst) {
                    warn!(error = %e, "Broker connection lost");
                }
                break;
            }
        };

        match op {
            ServerOp::Msg {
                subject,
                sid,
                reply,
                size,
            } => {
                let payload = match frames.payload(size).await {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Broker connection lost while reading payload");
                        break;
                    }
                };
                let mut subscriptions = shared.subscriptions.lock();
                let delivered = subscriptions.get(&sid).map(|tx| {
                    tx.send(Message {
                        subject,
                        reply,
                        payload,
                    })
                    .is_ok()
                });
                if delivered == Some(false) {
                    subscriptions.remove(&sid);
                }
            }
            ServerOp::Ping => {
                if shared.write(protocol::PONG).await.is_err() {
                    break;
                }
            }
            ServerOp::Pong => {
                if let Some(waiter) = shared.pending_pongs.lock().pop_front() {
                    let _ = waiter.send(());
                }
            }
            ServerOp::Err(message) => warn!(error = %message, "Broker reported an error"),
            ServerOp::Ok | ServerOp::Info(_) => {}
        }
    }

    shared.disconnect();
}
