use relay_protocol::SignalFrame;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// A mock mesh peer: listens on a loopback UDP port and records every
/// frame that decodes. Undecodable datagrams are dropped silently, like a
/// real node would.
pub struct MockUdpPeer {
    port: u16,
    frames: Arc<Mutex<Vec<SignalFrame>>>,
    task: JoinHandle<()>,
}

impl MockUdpPeer {
    /// Bind on an OS-assigned loopback port and start recording.
    pub async fn start() -> std::io::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let port = socket.local_addr()?.port();
        let frames: Arc<Mutex<Vec<SignalFrame>>> = Arc::new(Mutex::new(Vec::new()));

        let recorder = frames.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65_535];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, _src)) => {
                        if let Some(frame) = relay_protocol::decode(&buf[..len]) {
                            recorder.lock().expect("frame log poisoned").push(frame);
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(MockUdpPeer { port, frames, task })
    }

    /// The bound listen port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Snapshot of every frame received so far.
    pub fn received(&self) -> Vec<SignalFrame> {
        self.frames.lock().expect("frame log poisoned").clone()
    }

    /// Wait until a frame with the given signal type arrives, polling the
    /// record. Returns `None` on deadline.
    pub async fn wait_for_signal(
        &self,
        signal_type: u16,
        deadline: Duration,
    ) -> Option<SignalFrame> {
        let poll = Duration::from_millis(10);
        let mut waited = Duration::ZERO;
        loop {
            if let Some(frame) = self
                .received()
                .into_iter()
                .find(|f| f.signal_type == signal_type)
            {
                return Some(frame);
            }
            if waited >= deadline {
                return None;
            }
            tokio::time::sleep(poll).await;
            waited += poll;
        }
    }

    /// Stop listening and release the port. Simulates the peer going
    /// offline; datagrams sent afterwards get an ICMP port-unreachable.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for MockUdpPeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
