//! Client listener of the embedded broker
//!
//! Every accepted socket is split into a reader half, which parses client
//! operations and feeds the [`Router`], and a writer task, which drains the
//! connection's outbound queue. The queue is the only path to the socket, so
//! replies and deliveries never interleave mid-frame.

use super::protocol::{self, ClientOp, FrameError, FrameReader, ServerInfo};
use super::router::{ConnId, Origin, Router};
use super::subject;
use crate::error::Result;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

/// Accept client connections until the shutdown signal fires.
pub(crate) async fn serve(
    listener: TcpListener,
    router: Arc<Router>,
    info: ServerInfo,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "Broker listening for clients");

    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!(peer = %peer_addr, "New client connection");
                    let handler = ConnectionHandler {
                        router: router.clone(),
                        info: info.clone(),
                        peer_addr,
                    };
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) = handler.run(stream, shutdown).await {
                            warn!(peer = %peer_addr, error = %e, "Client connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept client connection");
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "Client connection task ended abnormally");
                }
            }
        }
    }

    drop(listener);
    router.close_all();
    connections.shutdown().await;
    info!(addr = %local_addr, "Broker listener stopped");
    Ok(())
}

struct ConnectionHandler {
    router: Arc<Router>,
    info: ServerInfo,
    peer_addr: SocketAddr,
}

/// What the reader loop does after handling one operation
enum Next {
    Continue,
    Close,
}

impl ConnectionHandler {
    async fn run(self, stream: TcpStream, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        stream.set_nodelay(true)?;
        let (reader, mut writer) = stream.into_split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let conn = self.router.add_connection(tx.clone());

        let peer = self.peer_addr;
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = writer.write_all(&frame).await {
                    debug!(peer = %peer, error = %e, "Client write failed");
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let _ = tx.send(protocol::encode_info(&self.info)?);

        let mut frames = FrameReader::new(reader);
        frames.set_max_payload(self.info.max_payload);
        let mut verbose = false;
        let result = loop {
            let line = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                    continue;
                }
                line = frames.next_line() => line,
            };

            match line {
                Ok(Some(line)) => {
                    trace!(conn, line = %line, "Client operation");
                    match self.handle_line(conn, &line, &mut frames, &tx, &mut verbose).await {
                        Ok(Next::Continue) => {}
                        Ok(Next::Close) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                Ok(None) => {
                    debug!(peer = %self.peer_addr, "Client disconnected");
                    break Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    let reply = match FrameError::of(&e) {
                        Some(FrameError::ControlLineExceeded) => protocol::ERR_MAX_CONTROL_LINE,
                        // read_line only fails this way on a line that is not UTF-8
                        _ => protocol::ERR_UNKNOWN_OP,
                    };
                    debug!(peer = %self.peer_addr, error = %e, "Rejecting malformed control line");
                    let _ = tx.send(protocol::encode_err(reply));
                    break Ok(());
                }
                Err(e) => break Err(e.into()),
            }
        };

        self.router.remove_connection(conn);
        drop(tx);
        let _ = writer_task.await;
        result
    }

    async fn handle_line<R>(
        &self,
        conn: ConnId,
        line: &str,
        frames: &mut FrameReader<R>,
        tx: &mpsc::UnboundedSender<Bytes>,
        verbose: &mut bool,
    ) -> Result<Next>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let op = match protocol::parse_client_op(line) {
            Ok(op) => op,
            Err(reason) => {
                warn!(peer = %self.peer_addr, reason = %reason, "Rejecting client operation");
                let _ = tx.send(protocol::encode_err(protocol::ERR_UNKNOWN_OP));
                return Ok(Next::Close);
            }
        };

        match op {
            ClientOp::Connect(connect) => {
                debug!(
                    conn,
                    name = connect.name.as_deref().unwrap_or(""),
                    echo = connect.echo,
                    "Client handshake"
                );
                *verbose = connect.verbose;
                self.router.set_echo(conn, connect.echo);
                self.ack(tx, *verbose);
            }
            ClientOp::Pub {
                subject,
                reply,
                size,
            } => {
                if size > self.info.max_payload {
                    let _ = tx.send(protocol::encode_err(protocol::ERR_MAX_PAYLOAD));
                    return Ok(Next::Close);
                }
                let payload = frames.payload(size).await?;
                if subject::validate_literal(&subject).is_err() {
                    let _ = tx.send(protocol::encode_err(protocol::ERR_INVALID_PUB_SUBJECT));
                    return Ok(Next::Continue);
                }
                self.router
                    .publish(Origin::Client(conn), &subject, reply.as_deref(), &payload);
                self.ack(tx, *verbose);
            }
            ClientOp::Sub {
                subject,
                queue,
                sid,
            } => match self.router.subscribe(conn, &sid, &subject, queue.as_deref()) {
                Ok(()) => self.ack(tx, *verbose),
                Err(_) => {
                    let _ = tx.send(protocol::encode_err(protocol::ERR_INVALID_SUBJECT));
                }
            },
            ClientOp::Unsub { sid, max } => {
                self.router.unsubscribe(conn, &sid, max);
                self.ack(tx, *verbose);
            }
            ClientOp::Ping => {
                let _ = tx.send(Bytes::from_static(protocol::PONG));
            }
            ClientOp::Pong => {}
        }

        Ok(Next::Continue)
    }

    fn ack(&self, tx: &mpsc::UnboundedSender<Bytes>, verbose: bool) {
        if verbose {
            let _ = tx.send(Bytes::from_static(protocol::OK));
        }
    }
}
