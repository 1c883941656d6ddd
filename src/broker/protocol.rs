//! Text wire protocol of the embedded broker
//!
//! The protocol is the core subset of the NATS client protocol, so standard
//! clients and upstream NATS servers can talk to it unchanged.
//!
//! ## Protocol Format
//!
//! Control lines are `\r\n` terminated. Operations that carry a payload are
//! followed by exactly `<#bytes>` of payload and another `\r\n`.
//!
//! ```text
//! Client -> Server                     Server -> Client
//! CONNECT {json}                       INFO {json}
//! PUB <subject> [reply] <#bytes>       MSG <subject> <sid> [reply] <#bytes>
//! SUB <subject> [queue] <sid>          PING / PONG
//! UNSUB <sid> [max]                    +OK
//! PING / PONG                          -ERR '<message>'
//! ```
//!
//! ## Example Session
//!
//! ```text
//! < INFO {"server_id":"...","max_payload":1048576,...}
//! > CONNECT {"verbose":false,"pedantic":false}
//! > SUB lambda 1
//! > PUB lambda 16
//! > Extension started
//! < MSG lambda 1 16
//! < Extension started
//! > PING
//! < PONG
//! ```

use crate::config::DEFAULT_MAX_PAYLOAD;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Longest control line accepted, in bytes
pub const MAX_CONTROL_LINE: u64 = 4096;

/// Protocol version advertised in INFO
pub const PROTOCOL_VERSION: u8 = 1;

pub(crate) const PING: &[u8] = b"PING\r\n";
pub(crate) const PONG: &[u8] = b"PONG\r\n";
pub(crate) const OK: &[u8] = b"+OK\r\n";

/// Error strings sent in `-ERR` lines
pub(crate) const ERR_UNKNOWN_OP: &str = "Unknown Protocol Operation";
pub(crate) const ERR_MAX_PAYLOAD: &str = "Maximum Payload Violation";
pub(crate) const ERR_INVALID_PUB_SUBJECT: &str = "Invalid Publish Subject";
pub(crate) const ERR_INVALID_SUBJECT: &str = "Invalid Subject";
pub(crate) const ERR_MAX_CONTROL_LINE: &str = "Maximum Control Line Exceeded";

/// Server description sent to every client on accept
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub proto: u8,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub max_payload: usize,
    #[serde(default)]
    pub headers: bool,
}

/// Options a client declares in CONNECT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lang: String,
    pub version: String,
    pub protocol: u8,
    pub echo: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
}

impl Default for ConnectInfo {
    fn default() -> Self {
        Self {
            verbose: false,
            pedantic: false,
            name: None,
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: PROTOCOL_VERSION,
            echo: true,
            user: None,
            pass: None,
        }
    }
}

/// Parsed client-to-server operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOp {
    /// CONNECT {json}
    Connect(ConnectInfo),
    /// PUB <subject> [reply] <#bytes>; payload follows
    Pub {
        subject: String,
        reply: Option<String>,
        size: usize,
    },
    /// SUB <subject> [queue] <sid>
    Sub {
        subject: String,
        queue: Option<String>,
        sid: String,
    },
    /// UNSUB <sid> [max]
    Unsub { sid: String, max: Option<u64> },
    Ping,
    Pong,
}

/// Parsed server-to-client operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOp {
    /// INFO {json}
    Info(ServerInfo),
    /// MSG <subject> <sid> [reply] <#bytes>; payload follows
    Msg {
        subject: String,
        sid: String,
        reply: Option<String>,
        size: usize,
    },
    Ping,
    Pong,
    Ok,
    Err(String),
}

/// Split a control line into its verb (upper-cased) and the rest.
fn split_verb(line: &str) -> (String, &str) {
    let line = line.trim();
    match line.find(|c: char| c.is_ascii_whitespace()) {
        Some(idx) => (line[..idx].to_uppercase(), line[idx..].trim_start()),
        None => (line.to_uppercase(), ""),
    }
}

fn parse_size(raw: &str) -> Result<usize, String> {
    raw.parse::<usize>()
        .map_err(|_| format!("invalid payload size '{}'", raw))
}

/// Parse a control line sent by a client.
pub fn parse_client_op(line: &str) -> Result<ClientOp, String> {
    let (verb, rest) = split_verb(line);
    let args: Vec<&str> = rest.split_whitespace().collect();

    match verb.as_str() {
        "PING" => Ok(ClientOp::Ping),
        "PONG" => Ok(ClientOp::Pong),
        "CONNECT" => {
            let info = if rest.is_empty() {
                ConnectInfo::default()
            } else {
                serde_json::from_str(rest).map_err(|e| format!("invalid CONNECT: {}", e))?
            };
            Ok(ClientOp::Connect(info))
        }
        "PUB" => match args.as_slice() {
            [subject, size] => Ok(ClientOp::Pub {
                subject: subject.to_string(),
                reply: None,
                size: parse_size(size)?,
            }),
            [subject, reply, size] => Ok(ClientOp::Pub {
                subject: subject.to_string(),
                reply: Some(reply.to_string()),
                size: parse_size(size)?,
            }),
            _ => Err("PUB requires: subject [reply] size".to_string()),
        },
        "SUB" => match args.as_slice() {
            [subject, sid] => Ok(ClientOp::Sub {
                subject: subject.to_string(),
                queue: None,
                sid: sid.to_string(),
            }),
            [subject, queue, sid] => Ok(ClientOp::Sub {
                subject: subject.to_string(),
                queue: Some(queue.to_string()),
                sid: sid.to_string(),
            }),
            _ => Err("SUB requires: subject [queue] sid".to_string()),
        },
        "UNSUB" => match args.as_slice() {
            [sid] => Ok(ClientOp::Unsub {
                sid: sid.to_string(),
                max: None,
            }),
            [sid, max] => Ok(ClientOp::Unsub {
                sid: sid.to_string(),
                max: Some(
                    max.parse()
                        .map_err(|_| format!("invalid UNSUB max '{}'", max))?,
                ),
            }),
            _ => Err("UNSUB requires: sid [max]".to_string()),
        },
        "" => Err("empty operation".to_string()),
        _ => Err(format!("unknown operation '{}'", verb)),
    }
}

/// Parse a control line sent by a server.
pub fn parse_server_op(line: &str) -> Result<ServerOp, String> {
    let (verb, rest) = split_verb(line);
    let args: Vec<&str> = rest.split_whitespace().collect();

    match verb.as_str() {
        "PING" => Ok(ServerOp::Ping),
        "PONG" => Ok(ServerOp::Pong),
        "+OK" => Ok(ServerOp::Ok),
        "-ERR" => Ok(ServerOp::Err(rest.trim_matches('\'').to_string())),
        "INFO" => serde_json::from_str(rest)
            .map(ServerOp::Info)
            .map_err(|e| format!("invalid INFO: {}", e)),
        "MSG" => match args.as_slice() {
            [subject, sid, size] => Ok(ServerOp::Msg {
                subject: subject.to_string(),
                sid: sid.to_string(),
                reply: None,
                size: parse_size(size)?,
            }),
            [subject, sid, reply, size] => Ok(ServerOp::Msg {
                subject: subject.to_string(),
                sid: sid.to_string(),
                reply: Some(reply.to_string()),
                size: parse_size(size)?,
            }),
            _ => Err("MSG requires: subject sid [reply] size".to_string()),
        },
        "" => Err("empty operation".to_string()),
        _ => Err(format!("unknown operation '{}'", verb)),
    }
}

/// Encode `INFO {json}`.
pub fn encode_info(info: &ServerInfo) -> Result<Bytes, serde_json::Error> {
    Ok(Bytes::from(format!("INFO {}\r\n", serde_json::to_string(info)?)))
}

/// Encode `CONNECT {json}`.
pub fn encode_connect(info: &ConnectInfo) -> Result<Bytes, serde_json::Error> {
    Ok(Bytes::from(format!(
        "CONNECT {}\r\n",
        serde_json::to_string(info)?
    )))
}

/// Encode `PUB` with its payload.
pub fn encode_pub(subject: &str, reply: Option<&str>, payload: &[u8]) -> Bytes {
    let header = match reply {
        Some(reply) => format!("PUB {} {} {}\r\n", subject, reply, payload.len()),
        None => format!("PUB {} {}\r\n", subject, payload.len()),
    };
    with_payload(header, payload)
}

/// Encode `MSG` with its payload.
pub fn encode_msg(subject: &str, sid: &str, reply: Option<&str>, payload: &[u8]) -> Bytes {
    let header = match reply {
        Some(reply) => format!("MSG {} {} {} {}\r\n", subject, sid, reply, payload.len()),
        None => format!("MSG {} {} {}\r\n", subject, sid, payload.len()),
    };
    with_payload(header, payload)
}

/// Encode `SUB`.
pub fn encode_sub(subject: &str, queue: Option<&str>, sid: &str) -> Bytes {
    match queue {
        Some(queue) => Bytes::from(format!("SUB {} {} {}\r\n", subject, queue, sid)),
        None => Bytes::from(format!("SUB {} {}\r\n", subject, sid)),
    }
}

/// Encode `UNSUB`.
pub fn encode_unsub(sid: &str, max: Option<u64>) -> Bytes {
    match max {
        Some(max) => Bytes::from(format!("UNSUB {} {}\r\n", sid, max)),
        None => Bytes::from(format!("UNSUB {}\r\n", sid)),
    }
}

/// Encode `-ERR '<message>'`.
pub fn encode_err(message: &str) -> Bytes {
    Bytes::from(format!("-ERR '{}'\r\n", message))
}

fn with_payload(header: String, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(header.len() + payload.len() + 2);
    buf.put_slice(header.as_bytes());
    buf.put_slice(payload);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Reason [`FrameReader`] rejected the input
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Maximum Control Line Exceeded")]
    ControlLineExceeded,
    #[error("Maximum Payload Violation")]
    PayloadTooLarge,
    #[error("payload is not terminated by CRLF")]
    MissingTerminator,
}

impl FrameError {
    /// The frame error carried by `err`, if any
    pub fn of(err: &io::Error) -> Option<FrameError> {
        err.get_ref()?.downcast_ref::<FrameError>().copied()
    }
}

impl From<FrameError> for io::Error {
    fn from(err: FrameError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// Buffered reader of control lines and payloads.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    line: String,
    max_payload: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            line: String::new(),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Largest payload [`payload`](Self::payload) will read. Zero keeps the default.
    pub fn set_max_payload(&mut self, max_payload: usize) {
        if max_payload > 0 {
            self.max_payload = max_payload;
        }
    }

    /// Read the next non-empty control line, without its terminator.
    ///
    /// Returns `Ok(None)` on a clean EOF. A line that is not valid UTF-8
    /// fails with `InvalidData` and no [`FrameError`].
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            self.line.clear();
            let read = (&mut self.inner)
                .take(MAX_CONTROL_LINE)
                .read_line(&mut self.line)
                .await?;
            if read == 0 {
                return Ok(None);
            }
            if !self.line.ends_with('\n') {
                if read as u64 >= MAX_CONTROL_LINE {
                    return Err(FrameError::ControlLineExceeded.into());
                }
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }
            let trimmed = self.line.trim_end_matches(['\r', '\n']);
            if !trimmed.trim().is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }

    /// Read a payload of exactly `size` bytes followed by `\r\n`.
    ///
    /// Sizes above the configured maximum are rejected before anything is
    /// allocated or read.
    pub async fn payload(&mut self, size: usize) -> io::Result<Bytes> {
        if size > self.max_payload {
            return Err(FrameError::PayloadTooLarge.into());
        }
        let mut buf = vec![0u8; size + 2];
        self.inner.read_exact(&mut buf).await?;
        if &buf[size..] != b"\r\n" {
            return Err(FrameError::MissingTerminator.into());
        }
        buf.truncate(size);
        Ok(Bytes::from(buf))
    }
}
