//! UDP discovery responder
//!
//! Answers `{"SECoP":"discover"}` broadcasts with one advertisement per
//! TCP interface of the node.

use crate::core::transport::TransportError;
use crate::utils::truncate_utf8;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Well known discovery port
pub const UDP_PORT: u16 = 10767;

/// Largest UDP payload that is never fragmented
pub const MAX_MESSAGE_LEN: usize = 508;

/// Advertisement of one interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    #[serde(rename = "SECoP")]
    kind: String,
    /// TCP port of the interface
    pub port: u16,
    /// Equipment id of the node
    pub equipment_id: String,
    /// Firmware string
    pub firmware: String,
    /// Node description, possibly truncated
    pub description: String,
}

impl Advertisement {
    /// Build an advertisement that fits into [`MAX_MESSAGE_LEN`]
    ///
    /// The description is cut on a character boundary. Returns `None` when
    /// even an empty description does not fit.
    pub fn new(equipment_id: &str, firmware: &str, description: &str) -> Option<Self> {
        let mut advert = Self {
            kind: "node".into(),
            port: u16::MAX,
            equipment_id: equipment_id.into(),
            firmware: firmware.into(),
            description: String::new(),
        };
        let overhead = advert.encode().len();
        if overhead > MAX_MESSAGE_LEN {
            return None;
        }
        let mut limit = MAX_MESSAGE_LEN - overhead;
        loop {
            advert.description = truncate_utf8(description, limit).to_string();
            let excess = advert.encode().len().saturating_sub(MAX_MESSAGE_LEN);
            if excess == 0 {
                return Some(advert);
            }
            // escaped characters take more room than their bytes
            limit = limit.saturating_sub(excess);
        }
    }

    /// Same advertisement for another port
    pub fn for_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    /// Compact JSON payload
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

fn is_discover_request(payload: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| v.get("SECoP").and_then(|s| s.as_str().map(|s| s == "discover")))
        .unwrap_or(false)
}

/// Discovery responder bound to a UDP socket
#[derive(Debug)]
pub struct Discovery {
    socket: UdpSocket,
    advert: Advertisement,
    ports: Vec<u16>,
}

impl Discovery {
    /// Bind the responder; `ports` are the TCP ports to advertise
    pub async fn bind(udp_port: u16, advert: Advertisement, ports: Vec<u16>) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, udp_port))).await?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket,
            advert,
            ports,
        })
    }

    /// Local address of the socket
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    async fn advertise(&self, to: SocketAddr) {
        for port in &self.ports {
            if let Err(e) = self.socket.send_to(&self.advert.for_port(*port).encode(), to).await {
                debug!(%to, error = %e, "discovery reply failed");
            }
        }
    }

    /// Announce the node once on the broadcast address
    pub async fn broadcast(&self, udp_port: u16) {
        debug!("sending startup UDP broadcast");
        self.advertise(SocketAddr::from((Ipv4Addr::BROADCAST, udp_port)))
            .await;
    }

    /// Answer discovery requests until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        let mut buf = [0u8; 1024];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        if is_discover_request(&buf[..len]) {
                            debug!(%from, "answering UDP discovery");
                            self.advertise(from).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "discovery socket failed");
                        break;
                    }
                },
            }
        }
        debug!("discovery responder stopped");
    }
}
