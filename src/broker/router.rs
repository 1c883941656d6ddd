//! Subscription table and message fan-out
//!
//! The router is the only state shared between connection tasks and the leaf
//! link. All locking is synchronous and never held across an await point.

use super::leaf::LeafCommand;
use super::protocol;
use super::subject;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Identifier of a local client connection
pub type ConnId = u64;

/// Where a publication entered the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A locally connected client
    Client(ConnId),
    /// The upstream peer, via the leaf link
    Leaf,
}

/// Runtime statistics of the embedded broker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    pub connections_total: u64,
    pub connections_active: u64,
    pub subscriptions: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub forwarded_upstream: u64,
    pub received_upstream: u64,
}

struct Connection {
    tx: mpsc::UnboundedSender<Bytes>,
    echo: bool,
}

#[derive(Debug, Clone)]
struct Subscription {
    conn: ConnId,
    subject: String,
    queue: Option<String>,
    max: Option<u64>,
    delivered: u64,
}

/// Routes publications to matching subscriptions.
pub struct Router {
    connections: RwLock<HashMap<ConnId, Connection>>,
    /// Subscriptions keyed by (connection, sid)
    subscriptions: Mutex<HashMap<(ConnId, String), Subscription>>,
    /// Local subscriber count per subject filter, mirrored upstream
    interest: Mutex<HashMap<String, usize>>,
    leaf: Mutex<Option<mpsc::UnboundedSender<LeafCommand>>>,
    next_conn_id: AtomicU64,
    queue_cursor: AtomicUsize,
    connections_total: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    forwarded_upstream: AtomicU64,
    received_upstream: AtomicU64,
}

impl Router {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            interest: Mutex::new(HashMap::new()),
            leaf: Mutex::new(None),
            next_conn_id: AtomicU64::new(1),
            queue_cursor: AtomicUsize::new(0),
            connections_total: AtomicU64::new(0),
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            forwarded_upstream: AtomicU64::new(0),
            received_upstream: AtomicU64::new(0),
        }
    }

    /// Attach the leaf link that receives interest changes and publications.
    pub fn attach_leaf(&self, tx: mpsc::UnboundedSender<LeafCommand>) {
        *self.leaf.lock() = Some(tx);
    }

    /// Detach the leaf link; later publications stay local.
    pub fn detach_leaf(&self) {
        *self.leaf.lock() = None;
    }

    /// Register a new client connection and return its id.
    pub fn add_connection(&self, tx: mpsc::UnboundedSender<Bytes>) -> ConnId {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .write()
            .insert(id, Connection { tx, echo: true });
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Apply the echo preference a client declared in CONNECT.
    pub fn set_echo(&self, conn: ConnId, echo: bool) {
        if let Some(connection) = self.connections.write().get_mut(&conn) {
            connection.echo = echo;
        }
    }

    /// Remove a connection and every subscription it owns.
    pub fn remove_connection(&self, conn: ConnId) {
        self.connections.write().remove(&conn);

        let removed: Vec<Subscription> = {
            let mut subs = self.subscriptions.lock();
            let keys: Vec<(ConnId, String)> =
                subs.keys().filter(|(c, _)| *c == conn).cloned().collect();
            keys.into_iter().filter_map(|k| subs.remove(&k)).collect()
        };
        for sub in removed {
            self.drop_interest(&sub.subject);
        }
    }

    /// Drop every connection's outbound channel so writer tasks can finish.
    pub fn close_all(&self) {
        self.connections.write().clear();
    }

    /// Add a subscription for `conn`.
    pub fn subscribe(
        &self,
        conn: ConnId,
        sid: &str,
        filter: &str,
        queue: Option<&str>,
    ) -> Result<(), String> {
        subject::validate_filter(filter)?;

        let replaced = self.subscriptions.lock().insert(
            (conn, sid.to_string()),
            Subscription {
                conn,
                subject: filter.to_string(),
                queue: queue.map(str::to_string),
                max: None,
                delivered: 0,
            },
        );
        if let Some(old) = replaced {
            self.drop_interest(&old.subject);
        }
        self.add_interest(filter);

        debug!(conn, sid, subject = %filter, queue = ?queue, "Subscription added");
        Ok(())
    }

    /// Remove a subscription now, or after `max` total deliveries.
    pub fn unsubscribe(&self, conn: ConnId, sid: &str, max: Option<u64>) {
        let key = (conn, sid.to_string());
        let removed = {
            let mut subs = self.subscriptions.lock();
            match (max, subs.get_mut(&key)) {
                (Some(max), Some(sub)) if sub.delivered < max => {
                    sub.max = Some(max);
                    None
                }
                _ => subs.remove(&key),
            }
        };
        if let Some(sub) = removed {
            self.drop_interest(&sub.subject);
            debug!(conn, sid, subject = %sub.subject, "Subscription removed");
        }
    }

    /// Deliver a publication to matching subscribers and, for local origins,
    /// forward it upstream. Returns the number of local deliveries.
    pub fn publish(
        &self,
        origin: Origin,
        subject: &str,
        reply: Option<&str>,
        payload: &Bytes,
    ) -> usize {
        self.route(origin, None, subject, reply, payload)
    }

    /// Deliver a message the upstream peer sent for the subscription on
    /// `filter`. Only local subscriptions on exactly that filter receive it,
    /// so overlapping filters do not see the same message twice.
    pub fn publish_upstream(
        &self,
        filter: &str,
        subject: &str,
        reply: Option<&str>,
        payload: &Bytes,
    ) -> usize {
        self.route(Origin::Leaf, Some(filter), subject, reply, payload)
    }

    fn route(
        &self,
        origin: Origin,
        only_filter: Option<&str>,
        subject: &str,
        reply: Option<&str>,
        payload: &Bytes,
    ) -> usize {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        if origin == Origin::Leaf {
            self.received_upstream.fetch_add(1, Ordering::Relaxed);
        } else {
            self.forward_upstream(subject, reply, payload);
        }

        let targets = self.select_targets(origin, only_filter, subject);
        if targets.is_empty() {
            trace!(subject, "No subscribers for publication");
            return 0;
        }

        let connections = self.connections.read();
        let mut delivered = 0;
        for (conn, sid) in targets {
            if let Some(connection) = connections.get(&conn) {
                let frame = protocol::encode_msg(subject, &sid, reply, payload);
                if connection.tx.send(frame).is_ok() {
                    delivered += 1;
                    self.messages_out.fetch_add(1, Ordering::Relaxed);
                    self.bytes_out
                        .fetch_add(payload.len() as u64, Ordering::Relaxed);
                }
            }
        }
        delivered
    }

    /// Distinct subject filters with at least one local subscriber.
    pub fn interest_subjects(&self) -> Vec<String> {
        let mut subjects: Vec<String> = self.interest.lock().keys().cloned().collect();
        subjects.sort();
        subjects
    }

    /// Snapshot of the broker statistics.
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections.read().len() as u64,
            subscriptions: self.subscriptions.lock().len() as u64,
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            forwarded_upstream: self.forwarded_upstream.load(Ordering::Relaxed),
            received_upstream: self.received_upstream.load(Ordering::Relaxed),
        }
    }

    /// Pick (connection, sid) targets: every plain subscriber plus one member
    /// per queue group. Applies auto-unsubscribe limits.
    fn select_targets(
        &self,
        origin: Origin,
        only_filter: Option<&str>,
        subject: &str,
    ) -> Vec<(ConnId, String)> {
        let no_echo: Option<ConnId> = match origin {
            Origin::Client(conn) => self
                .connections
                .read()
                .get(&conn)
                .filter(|c| !c.echo)
                .map(|_| conn),
            Origin::Leaf => None,
        };

        let mut targets = Vec::new();
        let mut exhausted = Vec::new();
        let mut limit_reached = Vec::new();
        {
            let mut subs = self.subscriptions.lock();
            let mut groups: HashMap<String, Vec<(ConnId, String)>> = HashMap::new();

            for (key, sub) in subs.iter() {
                if Some(sub.conn) == no_echo {
                    continue;
                }
                let wanted = match only_filter {
                    Some(filter) => sub.subject == filter,
                    None => subject::matches(&sub.subject, subject),
                };
                if !wanted {
                    continue;
                }
                match &sub.queue {
                    Some(queue) => groups.entry(queue.clone()).or_default().push(key.clone()),
                    None => targets.push(key.clone()),
                }
            }

            let mut queue_names: Vec<&String> = groups.keys().collect();
            queue_names.sort();
            for name in queue_names {
                let members = &groups[name];
                let pick = self.queue_cursor.fetch_add(1, Ordering::Relaxed) % members.len();
                targets.push(members[pick].clone());
            }

            for key in &targets {
                if let Some(sub) = subs.get_mut(key) {
                    sub.delivered += 1;
                    if sub.max.is_some_and(|max| sub.delivered >= max) {
                        limit_reached.push(key.clone());
                    }
                }
            }
            for key in limit_reached {
                if let Some(sub) = subs.remove(&key) {
                    exhausted.push((key, sub.subject));
                }
            }
        }

        for ((conn, sid), filter) in &exhausted {
            debug!(conn, sid = %sid, "Subscription reached its delivery limit");
            self.drop_interest(filter);
        }

        targets
    }

    fn forward_upstream(&self, subject: &str, reply: Option<&str>, payload: &Bytes) {
        if let Some(leaf) = self.leaf.lock().as_ref() {
            let command = LeafCommand::Publish {
                subject: subject.to_string(),
                reply: reply.map(str::to_string),
                payload: payload.clone(),
            };
            if leaf.send(command).is_ok() {
                self.forwarded_upstream.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn add_interest(&self, filter: &str) {
        let first = {
            let mut interest = self.interest.lock();
            let count = interest.entry(filter.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first {
            self.notify_leaf(LeafCommand::Subscribe(filter.to_string()));
        }
    }

    fn drop_interest(&self, filter: &str) {
        let last = release_interest(&mut self.interest.lock(), filter);
        if last {
            self.notify_leaf(LeafCommand::Unsubscribe(filter.to_string()));
        }
    }

    fn notify_leaf(&self, command: LeafCommand) {
        if let Some(leaf) = self.leaf.lock().as_ref() {
            let _ = leaf.send(command);
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrement the interest count for `filter`; true when it reached zero.
fn release_interest(interest: &mut HashMap<String, usize>, filter: &str) -> bool {
    match interest.get_mut(filter) {
        Some(count) if *count > 1 => {
            *count -= 1;
            false
        }
        Some(_) => {
            interest.remove(filter);
            true
        }
        None => false,
    }
}
