//! Periodic HEARTBEAT emitter.
//!
//! Fires on a fixed tick (default 30 s) and sends one HEARTBEAT datagram to
//! every configured peer, fire-and-forget. Send failures are logged by the
//! engine and never retried; liveness signaling is best-effort.

use crate::engine::RelayEngine;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Run the heartbeat ticker until shutdown is signaled.
pub async fn run(
    engine: RelayEngine,
    peers: Vec<String>,
    interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    if peers.is_empty() {
        debug!("no heartbeat peers configured, ticker idle");
        return;
    }
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    // The first tick fires immediately; announce ourselves on startup.
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                engine.send_heartbeats(&peers).await;
            }
            _ = shutdown.changed() => {
                debug!("heartbeat ticker stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::Store;
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn peers_receive_heartbeats_on_the_tick() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();

        let mut config = Config::default();
        config.peer_ports = [("alpha".to_owned(), port)].into_iter().collect();
        let engine = RelayEngine::new(&config, Store::open_in_memory().unwrap());

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(engine, vec!["alpha".to_owned()], 10, rx));

        let mut buf = vec![0u8; 2048];
        let n = tokio::time::timeout(Duration::from_secs(2), peer.recv(&mut buf))
            .await
            .expect("heartbeat within deadline")
            .unwrap();
        let frame = relay_protocol::decode(&buf[..n]).expect("valid frame");
        assert_eq!(frame.signal_type, relay_protocol::codes::HEARTBEAT);
        assert_eq!(frame.sender(), Some("synapse-relay"));

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
