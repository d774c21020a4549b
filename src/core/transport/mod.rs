//! Network interfaces of a node
//!
//! Supports:
//! - Raw TCP, one message per line
//! - WebSocket, one message per text frame
//!
//! Both share the connection handler in [`handler`]; an adapter only
//! supplies framing, the peer name and shutdown of the stream.

mod handler;
mod tcp;
mod ws;

pub use handler::{serve_connection, HandlerOptions};
pub use tcp::{bind_listener, serve_tcp, TcpChannel};
pub use ws::{serve_ws, WsChannel};

use crate::core::codec::{Message, WireError};
use crate::core::dispatcher::Dispatch;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Peer closed the connection
    #[error("Connection closed by peer")]
    Closed,

    /// Operation timed out
    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol failure
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Port still in use after all bind attempts
    #[error("Address already in use: {0}")]
    AddrInUse(String),

    /// Unparsable interface specification
    #[error("Invalid interface '{0}'")]
    InvalidInterface(String),
}

/// Identifier of one client connection, unique for the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Next free identifier
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Messages a connection may have queued before it counts as stalled
pub const QUEUE_CAPACITY: usize = 4096;

/// Outgoing side of a client connection as seen by the dispatcher
///
/// Messages are queued and written by the connection's own task, so
/// sending never blocks and keeps the order of the calls. A peer that
/// lets the queue fill up is marked stalled and gets disconnected.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    peer: String,
    tx: mpsc::Sender<Message>,
    stalled: CancellationToken,
}

impl Connection {
    /// Create a connection and the receiver its writer drains
    pub fn channel(peer: impl Into<String>) -> (Self, mpsc::Receiver<Message>) {
        Self::with_capacity(peer, QUEUE_CAPACITY)
    }

    /// Same as [`Connection::channel`] with a custom queue length
    pub fn with_capacity(peer: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            id: ConnectionId::next(),
            peer: peer.into(),
            tx,
            stalled: CancellationToken::new(),
        };
        (conn, rx)
    }

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer description for logs
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue a message; false once the connection is gone or stalled
    pub fn send(&self, msg: Message) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if !self.stalled.is_cancelled() {
                    warn!(conn = %self.id, peer = %self.peer, "outgoing queue full, dropping client");
                    self.stalled.cancel();
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Cancelled once the peer stopped draining its queue
    pub fn stalled(&self) -> &CancellationToken {
        &self.stalled
    }
}

/// One side of a framed client stream
#[async_trait]
pub trait Channel: Send {
    /// Next decoded message; `Ok(None)` when the peer closed the stream
    async fn receive(&mut self) -> Result<Option<Result<Message, WireError>>, TransportError>;

    /// Write one message
    async fn send(&mut self, msg: Message) -> Result<(), TransportError>;

    /// Peer description for logs
    fn peer(&self) -> String;

    /// Close the stream
    async fn close(&mut self);
}

/// Interface scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Raw TCP
    Tcp,
    /// WebSocket
    Ws,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Ws => write!(f, "ws"),
        }
    }
}

/// A listening interface, written `tcp://10767`, `ws://10768` or `10767`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Interface {
    /// Scheme
    pub scheme: Scheme,
    /// TCP port, 0 picks a free one
    pub port: u16,
}

impl Interface {
    /// TCP interface on `port`
    pub fn tcp(port: u16) -> Self {
        Self {
            scheme: Scheme::Tcp,
            port,
        }
    }

    /// WebSocket interface on `port`
    pub fn ws(port: u16) -> Self {
        Self {
            scheme: Scheme::Ws,
            port,
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.port)
    }
}

impl FromStr for Interface {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, port) = match s.split_once("://") {
            Some(("tcp", port)) => (Scheme::Tcp, port),
            Some(("ws", port)) => (Scheme::Ws, port),
            Some(_) => return Err(TransportError::InvalidInterface(s.to_string())),
            None => (Scheme::Tcp, s),
        };
        let port = port
            .parse()
            .map_err(|_| TransportError::InvalidInterface(s.to_string()))?;
        Ok(Self { scheme, port })
    }
}

impl TryFrom<String> for Interface {
    type Error = TransportError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Interface> for String {
    fn from(interface: Interface) -> Self {
        interface.to_string()
    }
}

/// Bind `interface` and serve it until `shutdown` is cancelled
///
/// `started` is called with the bound port once the listener accepts
/// connections. Bind failures are returned without calling it.
pub async fn run_interface(
    interface: Interface,
    ipv6: bool,
    dispatch: Arc<dyn Dispatch>,
    options: HandlerOptions,
    shutdown: CancellationToken,
    started: impl FnOnce(u16) + Send,
) -> Result<(), TransportError> {
    let listener = bind_listener(interface.port, ipv6, &shutdown).await?;
    let port = listener.local_addr()?.port();
    started(port);
    match interface.scheme {
        Scheme::Tcp => serve_tcp(listener, dispatch, options, shutdown).await,
        Scheme::Ws => serve_ws(listener, dispatch, options, shutdown).await,
    }
    Ok(())
}
