//! Embedded broker
//!
//! An in-process publish/subscribe broker that local clients reach over
//! loopback TCP, joined to one upstream peer through a leaf link.
//!
//! ## Architecture
//!
//! ```text
//!  local clients ──► server (accept loop) ──► router ──► local subscribers
//!                                               │ ▲
//!                                  LeafCommand  ▼ │  upstream MSG
//!                                              leaf ◄──► upstream peer
//! ```
//!
//! [`start`] returns as soon as the serve and leaf tasks are spawned; the
//! listener binds inside the serve task. Readiness is observed through
//! [`BrokerHandle::ready`] or by a client connecting with retry.

pub mod leaf;
pub mod protocol;
pub mod router;
pub mod server;
pub mod subject;

pub use leaf::LeafState;
pub use router::BrokerStats;

use crate::config::{
    DEFAULT_EXTENSION_NAME, DEFAULT_LEAF_RECONNECT_INTERVAL, DEFAULT_MAX_PAYLOAD,
    DEFAULT_SHUTDOWN_TIMEOUT,
};
use crate::error::{ExtensionError, Result};
use leaf::LeafLink;
use parking_lot::Mutex;
use protocol::ServerInfo;
use router::Router;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

/// Runtime options of the embedded broker
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Loopback address local clients connect to
    pub listen_addr: SocketAddr,
    /// The single leaf remote
    pub upstream: Url,
    /// Name advertised in INFO and sent upstream in CONNECT
    pub server_name: String,
    /// Largest accepted payload in bytes
    pub max_payload: usize,
    /// Fixed pause between leaf reconnect attempts
    pub leaf_reconnect_interval: Duration,
    /// How long shutdown waits for the accept task
    pub shutdown_timeout: Duration,
}

impl BrokerConfig {
    pub fn new(listen_addr: SocketAddr, upstream: Url) -> Self {
        Self {
            listen_addr,
            upstream,
            server_name: DEFAULT_EXTENSION_NAME.to_string(),
            max_payload: DEFAULT_MAX_PAYLOAD,
            leaf_reconnect_interval: DEFAULT_LEAF_RECONNECT_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Bind host as a string
    pub fn host(&self) -> String {
        self.listen_addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.listen_addr.port()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_payload == 0 {
            return Err(ExtensionError::config(
                "max_payload",
                "must be greater than zero",
            ));
        }
        if self.leaf_reconnect_interval.is_zero() {
            return Err(ExtensionError::config(
                "leaf_reconnect_interval",
                "must be greater than zero",
            ));
        }
        if self.upstream.host_str().map_or(true, str::is_empty) {
            return Err(ExtensionError::config(
                "peer_url",
                "upstream peer must name a host",
            ));
        }
        Ok(())
    }
}

/// Lifecycle of the serve task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerStatus {
    /// Spawned, listener not bound yet
    Starting,
    /// Accepting client connections
    Serving,
    /// The listener could not be bound or the accept loop failed
    Failed,
    /// Shut down
    Stopped,
}

struct BrokerInner {
    config: BrokerConfig,
    router: Arc<Router>,
    shutdown_tx: watch::Sender<bool>,
    status: Arc<watch::Sender<BrokerStatus>>,
    leaf_state: watch::Receiver<LeafState>,
    bound_addr: Arc<Mutex<Option<SocketAddr>>>,
    failure: Arc<Mutex<Option<String>>>,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
    shut_down: AtomicBool,
}

/// Handle to a running embedded broker.
///
/// Cloning is cheap; every clone controls the same broker.
#[derive(Clone)]
pub struct BrokerHandle {
    inner: Arc<BrokerInner>,
}

/// Start the embedded broker on the current tokio runtime.
///
/// Returns once the serve and leaf tasks are spawned, without waiting for
/// the listener to bind. Only an invalid configuration or a missing runtime
/// fails here.
pub fn start(config: BrokerConfig) -> Result<BrokerHandle> {
    config.validate()?;
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| ExtensionError::broker("start", e.to_string()))?;

    let router = Arc::new(Router::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let status = Arc::new(watch::channel(BrokerStatus::Starting).0);
    let (leaf_state_tx, leaf_state) = watch::channel(LeafState::Disconnected);
    let bound_addr = Arc::new(Mutex::new(None));
    let failure = Arc::new(Mutex::new(None));

    let server_id = server_id(&config.server_name);
    let (leaf_tx, leaf_rx) = mpsc::unbounded_channel();
    router.attach_leaf(leaf_tx);
    let link = LeafLink::new(
        config.upstream.clone(),
        server_id.clone(),
        config.server_name.clone(),
        config.leaf_reconnect_interval,
        router.clone(),
        leaf_state_tx,
    );
    let leaf_task = runtime.spawn(link.run(leaf_rx, shutdown_rx.clone()));

    let serve_task = runtime.spawn(serve_task(
        config.clone(),
        server_id,
        router.clone(),
        shutdown_rx,
        status.clone(),
        bound_addr.clone(),
        failure.clone(),
    ));

    info!(
        addr = %config.listen_addr,
        upstream = %redacted(&config.upstream),
        "Embedded broker starting"
    );

    Ok(BrokerHandle {
        inner: Arc::new(BrokerInner {
            config,
            router,
            shutdown_tx,
            status,
            leaf_state,
            bound_addr,
            failure,
            tasks: Mutex::new(Some((serve_task, leaf_task))),
            shut_down: AtomicBool::new(false),
        }),
    })
}

async fn serve_task(
    config: BrokerConfig,
    server_id: String,
    router: Arc<Router>,
    shutdown: watch::Receiver<bool>,
    status: Arc<watch::Sender<BrokerStatus>>,
    bound_addr: Arc<Mutex<Option<SocketAddr>>>,
    failure: Arc<Mutex<Option<String>>>,
) {
    if *shutdown.borrow() {
        status.send_replace(BrokerStatus::Stopped);
        return;
    }

    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            let err = ExtensionError::broker_bind_failed(config.listen_addr.to_string(), e.to_string());
            error!(error = %err, "Embedded broker failed to start");
            *failure.lock() = Some(err.to_string());
            status.send_replace(BrokerStatus::Failed);
            return;
        }
    };

    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "Embedded broker failed to read its bound address");
            *failure.lock() = Some(e.to_string());
            status.send_replace(BrokerStatus::Failed);
            return;
        }
    };
    *bound_addr.lock() = Some(local_addr);

    let info = ServerInfo {
        server_id,
        server_name: config.server_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        proto: protocol::PROTOCOL_VERSION,
        host: local_addr.ip().to_string(),
        port: local_addr.port(),
        max_payload: config.max_payload,
        headers: false,
    };

    status.send_replace(BrokerStatus::Serving);
    match server::serve(listener, router, info, shutdown).await {
        Ok(()) => {
            status.send_replace(BrokerStatus::Stopped);
        }
        Err(e) => {
            error!(error = %e, "Embedded broker accept loop failed");
            *failure.lock() = Some(e.to_string());
            status.send_replace(BrokerStatus::Failed);
        }
    }
}

impl BrokerHandle {
    /// Stop the broker: stop accepting, close every connection, stop the
    /// leaf link, and wait for the listener to be released.
    ///
    /// Safe to call any number of times, and before the broker is serving.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Embedded broker already shut down");
            return Ok(());
        }

        info!(addr = %self.inner.config.listen_addr, "Shutting down embedded broker");
        self.inner.shutdown_tx.send_replace(true);

        let tasks = self.inner.tasks.lock().take();
        let mut result = Ok(());
        if let Some((serve, leaf)) = tasks {
            let timeout = self.inner.config.shutdown_timeout;
            for (name, task) in [("serve", serve), ("leaf", leaf)] {
                if let Err(e) = join_with_timeout(name, task, timeout).await {
                    result = Err(e);
                }
            }
        }

        self.inner.router.detach_leaf();
        self.inner.router.close_all();
        if *self.inner.status.borrow() != BrokerStatus::Failed {
            self.inner.status.send_replace(BrokerStatus::Stopped);
        }
        info!("Embedded broker stopped");
        result
    }

    /// Wait until the listener is bound and return its address.
    pub async fn ready(&self) -> Result<SocketAddr> {
        let mut status = self.inner.status.subscribe();
        let current = *status
            .wait_for(|s| *s != BrokerStatus::Starting)
            .await
            .map_err(|e| ExtensionError::broker("ready", e.to_string()))?;

        match current {
            BrokerStatus::Serving => self
                .local_addr()
                .ok_or_else(|| ExtensionError::broker("ready", "listener address unknown")),
            BrokerStatus::Failed => Err(ExtensionError::broker(
                "ready",
                self.inner
                    .failure
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "broker failed".to_string()),
            )),
            BrokerStatus::Starting | BrokerStatus::Stopped => Err(ExtensionError::ShuttingDown),
        }
    }

    pub fn status(&self) -> BrokerStatus {
        *self.inner.status.borrow()
    }

    pub fn stats(&self) -> BrokerStats {
        self.inner.router.stats()
    }

    pub fn leaf_state(&self) -> LeafState {
        *self.inner.leaf_state.borrow()
    }

    /// Receiver for leaf link state changes
    pub fn watch_leaf_state(&self) -> watch::Receiver<LeafState> {
        self.inner.leaf_state.clone()
    }

    /// Configured bind address
    pub fn listen_addr(&self) -> SocketAddr {
        self.inner.config.listen_addr
    }

    /// Actual bound address, once serving
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.bound_addr.lock()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for BrokerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerHandle")
            .field("listen_addr", &self.inner.config.listen_addr)
            .field("status", &self.status())
            .field("leaf_state", &self.leaf_state())
            .finish()
    }
}

async fn join_with_timeout(name: &str, mut task: JoinHandle<()>, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) if e.is_cancelled() => Ok(()),
        Ok(Err(e)) => Err(ExtensionError::broker_task_failed(name, e.to_string())),
        Err(_) => {
            warn!(task = name, timeout_ms = timeout.as_millis() as u64, "Broker task did not stop in time, aborting");
            task.abort();
            Ok(())
        }
    }
}

fn server_id(name: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{}-{}-{:x}", name, std::process::id(), nanos)
}

/// Upstream locator without credentials, for logs
fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    let _ = url.set_password(None);
    let _ = url.set_username("");
    url.to_string()
}
