//! TCP interface: newline terminated messages

use super::{serve_connection, Channel, HandlerOptions, TransportError};
use crate::core::codec::{Message, SecopCodec, WireError};
use crate::core::dispatcher::Dispatch;
use crate::utils::RecoveryPolicy;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A framed TCP client stream
pub struct TcpChannel {
    framed: Framed<TcpStream, SecopCodec>,
    peer: SocketAddr,
}

impl TcpChannel {
    /// Wrap an accepted stream
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        // small replies, keep latency low
        stream.set_nodelay(true).ok();
        Self {
            framed: Framed::new(stream, SecopCodec::new()),
            peer,
        }
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn receive(&mut self) -> Result<Option<Result<Message, WireError>>, TransportError> {
        match self.framed.next().await {
            Some(Ok(item)) => Ok(Some(item)),
            Some(Err(e)) if e.kind() == ErrorKind::ConnectionReset => Ok(None),
            Some(Err(e)) => Err(TransportError::Io(e)),
            None => Ok(None),
        }
    }

    async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        self.framed.send(msg).await.map_err(TransportError::Io)
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }

    async fn close(&mut self) {
        self.framed.get_mut().shutdown().await.ok();
    }
}

/// Bind a listener, retrying while the port is still in use
///
/// Other bind errors fail at once. Gives up early when `shutdown` is
/// cancelled during a retry delay.
pub async fn bind_listener(
    port: u16,
    ipv6: bool,
    shutdown: &CancellationToken,
) -> Result<TcpListener, TransportError> {
    let addr = if ipv6 {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))
    } else {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
    };
    let policy = RecoveryPolicy::bind();
    let mut attempt = 0;
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                attempt += 1;
                if !policy.should_attempt(attempt) {
                    return Err(TransportError::AddrInUse(addr.to_string()));
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                warn!(%addr, attempt, ?delay, "address in use, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => return Err(TransportError::AddrInUse(addr.to_string())),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(TransportError::Io(e)),
        }
    }
}

/// Accept TCP clients until `shutdown` is cancelled
///
/// Each client gets its own task; cancelling `shutdown` also stops them.
pub async fn serve_tcp(
    listener: TcpListener,
    dispatch: Arc<dyn Dispatch>,
    options: HandlerOptions,
    shutdown: CancellationToken,
) {
    let local = listener.local_addr().ok();
    info!(interface = ?local, "TCP interface listening");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted TCP client");
                    let channel = TcpChannel::new(stream, peer);
                    tokio::spawn(serve_connection(
                        channel,
                        dispatch.clone(),
                        options,
                        shutdown.child_token(),
                    ));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }
    info!(interface = ?local, "TCP interface stopped");
}
