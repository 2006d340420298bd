//! Outbound datagram delivery.
//!
//! Every send goes out as a framed binary datagram from a short-lived
//! connected socket. UDP gives no delivery receipt, so classification works
//! in two steps: an OS-level send error fails the target immediately, and a
//! short probe window afterwards catches an ICMP port-unreachable surfaced
//! as `ECONNREFUSED` on the connected socket. Probe silence counts as
//! reached.
//!
//! Fan-out is concurrent: all per-target sends are initiated together and
//! the call resolves when the slowest finishes, not after the sum.

use crate::model::Payload;
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Per-target delivery outcome.
#[derive(Debug)]
pub enum SendError {
    /// Target name has no entry in the peer-port map.
    UnknownTarget(String),
    /// Payload failed to serialize.
    Encode(String),
    /// OS-level socket failure (bind/connect/send), or a probe-window
    /// connection-refused from the target.
    Io(std::io::Error),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::UnknownTarget(name) => write!(f, "unknown target '{name}'"),
            SendError::Encode(e) => write!(f, "encode failed: {e}"),
            SendError::Io(e) => write!(f, "send failed: {e}"),
        }
    }
}

impl std::error::Error for SendError {}

// ---------------------------------------------------------------------------
// DeliverySender
// ---------------------------------------------------------------------------

/// Owns the peer-port map and the send path. Read-only after startup, so it
/// is shared freely across tasks.
pub struct DeliverySender {
    node_name: String,
    peer_ports: HashMap<String, u16>,
    /// How long to listen for an ICMP-refused signal after a send; 0
    /// disables probing (every OS-accepted send counts as reached).
    probe_ms: u64,
    /// Advisory outbound whitelist; off-list sends are logged, not blocked.
    outgoing: HashSet<u16>,
}

impl DeliverySender {
    pub fn new(
        node_name: String,
        peer_ports: HashMap<String, u16>,
        probe_ms: u64,
        outgoing: HashSet<u16>,
    ) -> Self {
        DeliverySender {
            node_name,
            peer_ports,
            probe_ms,
            outgoing,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Peer names in the configured port map.
    pub fn peer_names(&self) -> Vec<String> {
        self.peer_ports.keys().cloned().collect()
    }

    /// Resolve a peer name to its loopback socket address.
    pub fn resolve(&self, name: &str) -> Option<SocketAddr> {
        self.peer_ports
            .get(name)
            .map(|port| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), *port))
    }

    /// Send one signal to one named target and classify the outcome.
    pub async fn send_signal(
        &self,
        target: &str,
        signal_type: u16,
        payload: &Payload,
    ) -> Result<(), SendError> {
        let Some(addr) = self.resolve(target) else {
            warn!(target, "target has no configured peer port");
            return Err(SendError::UnknownTarget(target.to_owned()));
        };
        if !self.outgoing.is_empty() && !self.outgoing.contains(&signal_type) {
            warn!(signal_type, target, "signal type not on the outgoing list");
        }

        let frame = relay_protocol::encode(signal_type, &self.node_name, payload)
            .map_err(|e| SendError::Encode(e.to_string()))?;
        self.send_probed(addr, &frame).await
    }

    /// Concurrent fan-out of one signal to many targets. Outcomes are
    /// independent and returned in input order.
    pub async fn fan_out(
        &self,
        signal_type: u16,
        payload: &Payload,
        targets: &[String],
    ) -> Vec<(String, Result<(), SendError>)> {
        let sends = targets.iter().map(|target| async move {
            let outcome = self.send_signal(target, signal_type, payload).await;
            (target.clone(), outcome)
        });
        join_all(sends).await
    }

    /// Fire-and-forget datagram to an explicit address (replies,
    /// heartbeats). No probe window, no classification.
    pub async fn send_to_addr(
        &self,
        addr: SocketAddr,
        signal_type: u16,
        payload: &Payload,
    ) -> Result<(), SendError> {
        let frame = relay_protocol::encode(signal_type, &self.node_name, payload)
            .map_err(|e| SendError::Encode(e.to_string()))?;
        let socket = ephemeral_socket().await.map_err(SendError::Io)?;
        socket
            .send_to(&frame, addr)
            .await
            .map(|_| ())
            .map_err(SendError::Io)
    }

    async fn send_probed(&self, addr: SocketAddr, frame: &[u8]) -> Result<(), SendError> {
        let socket = ephemeral_socket().await.map_err(SendError::Io)?;
        socket.connect(addr).await.map_err(SendError::Io)?;
        socket.send(frame).await.map_err(SendError::Io)?;

        if self.probe_ms == 0 {
            return Ok(());
        }

        // Nothing legitimate answers on this ephemeral socket; the only
        // thing the probe can observe is the kernel surfacing an ICMP
        // port-unreachable for the datagram we just sent.
        let mut buf = [0u8; 1];
        match tokio::time::timeout(Duration::from_millis(self.probe_ms), socket.recv(&mut buf))
            .await
        {
            Err(_elapsed) => Ok(()),
            Ok(Ok(_)) => {
                debug!(%addr, "unexpected datagram on probe socket, counting as reached");
                Ok(())
            }
            Ok(Err(e)) => Err(SendError::Io(e)),
        }
    }
}

async fn ephemeral_socket() -> std::io::Result<UdpSocket> {
    UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
