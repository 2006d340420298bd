//! Inbound datagram dispatcher.
//!
//! One socket, one receive loop. Each datagram is decoded, run through the
//! tumbler, and dispatched on its own task so a slow handler never stalls
//! the socket. Undecodable and rejected datagrams are logged and dropped;
//! nothing on the inbound path ever propagates an error to the loop.

use crate::engine::RelayEngine;
use crate::handlers;
use crate::model::now_ms;
use crate::tumbler::Tumbler;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Largest accepted datagram. UDP caps payloads below this anyway.
const MAX_DATAGRAM: usize = 65_535;

/// Run the receive loop until shutdown is signaled.
pub async fn run(
    engine: RelayEngine,
    tumbler: Tumbler,
    socket: UdpSocket,
    mut shutdown: watch::Receiver<bool>,
) {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    info!(addr = ?socket.local_addr().ok(), "listening for datagrams");

    loop {
        tokio::select! {
            incoming = socket.recv_from(&mut buf) => match incoming {
                Ok((len, src)) => {
                    let data = buf[..len].to_vec();
                    let engine = engine.clone();
                    let tumbler = tumbler.clone();
                    tokio::spawn(async move {
                        dispatch_datagram(&engine, &tumbler, &data, src).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "recv_from failed");
                }
            },
            _ = shutdown.changed() => {
                info!("datagram dispatcher stopping");
                return;
            }
        }
    }
}

/// Decode → tumble → handle one datagram, sending the reply if one comes
/// back. Public so integration tests can drive it without a socket loop.
pub async fn dispatch_datagram(
    engine: &RelayEngine,
    tumbler: &Tumbler,
    data: &[u8],
    src: SocketAddr,
) {
    let Some(frame) = relay_protocol::decode(data) else {
        error!(%src, len = data.len(), "undecodable datagram dropped");
        return;
    };

    if let Err(rejection) = tumbler.admit(&frame, now_ms()) {
        error!(%src, signal_type = format!("0x{:02X}", frame.signal_type), %rejection,
            "datagram rejected");
        return;
    }

    if let Some(reply) = handlers::handle_frame(engine, frame, src).await
        && let Err(e) = engine
            .sender()
            .send_to_addr(reply.addr, reply.signal_type, &reply.payload)
            .await
    {
        warn!(addr = %reply.addr, error = %e, "reply send failed");
    }
}
