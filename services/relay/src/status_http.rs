//! Local status HTTP server.
//!
//! Provides:
//! - `GET /healthz` — always 200 OK (process is running)
//! - `GET /readyz`  — 200 when local subsystems are ready, 503 otherwise
//! - `GET /status`  — JSON: version, node name, peer count, buffer counts
//!
//! # Readiness contract
//! `/readyz` reflects local prerequisites only (config + store + worker
//! loops). Peer reachability does NOT affect readiness.
//!
//! # Security
//! No authentication. Read-only.

use crate::engine::RelayEngine;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// Subsystem readiness
// ---------------------------------------------------------------------------

/// Tracks local subsystem readiness for the `/readyz` endpoint.
#[derive(Debug, Clone)]
pub struct SubsystemStatus {
    ready: bool,
    reason: Option<String>,
}

impl SubsystemStatus {
    pub fn ready() -> Self {
        SubsystemStatus {
            ready: true,
            reason: None,
        }
    }

    pub fn not_ready(reason: String) -> Self {
        SubsystemStatus {
            ready: false,
            reason: Some(reason),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Status code and body for `/readyz`.
    fn readiness_reply(&self) -> (u16, String) {
        if self.ready {
            return (200, "ready".to_owned());
        }
        let reason = self.reason.as_deref().unwrap_or("subsystems not ready");
        (503, reason.to_owned())
    }
}

// ---------------------------------------------------------------------------
// StatusServer
// ---------------------------------------------------------------------------

/// Handle to the running status HTTP server.
pub struct StatusServer {
    local_addr: SocketAddr,
}

impl StatusServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bind and start serving in a background task.
    pub async fn start(
        bind: &str,
        version: String,
        subsystem: SubsystemStatus,
        engine: RelayEngine,
    ) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        let subsystem = Arc::new(Mutex::new(subsystem));
        let version = Arc::new(version);

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let subsystem = subsystem.clone();
                        let version = version.clone();
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, subsystem, version, engine).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(StatusServer { local_addr })
    }
}

// ---------------------------------------------------------------------------
// Request handler
// ---------------------------------------------------------------------------

async fn handle_connection(
    mut stream: TcpStream,
    subsystem: Arc<Mutex<SubsystemStatus>>,
    version: Arc<String>,
    engine: RelayEngine,
) {
    // Only the request line matters here; headers and any body are ignored,
    // so one read of the front of the stream is enough.
    let mut buf = [0u8; 2048];
    let Ok(n) = stream.read(&mut buf).await else {
        return;
    };
    if n == 0 {
        return;
    }
    let head = String::from_utf8_lossy(&buf[..n]);
    let mut request_line = head.lines().next().unwrap_or("").split_whitespace();
    let method = request_line.next().unwrap_or("");
    let path = request_line.next().unwrap_or("");

    let (status, content_type, body) = match (method, path) {
        ("GET", "/healthz") => (200, "text/plain", "ok".to_owned()),
        ("GET", "/readyz") => {
            let (status, body) = subsystem.lock().await.readiness_reply();
            (status, "text/plain", body)
        }
        ("GET", "/status") => {
            let buffer = engine.buffer().counts().await.unwrap_or_default();
            let report = json!({
                "node": engine.node_name(),
                "version": *version,
                "peers": engine.sender().peer_names().len(),
                "buffer": buffer,
            });
            (200, "application/json", report.to_string())
        }
        _ => (404, "text/plain", "Not Found".to_owned()),
    };
    write_reply(&mut stream, status, content_type, &body).await;
}

// ---------------------------------------------------------------------------
// Minimal HTTP/1.1 reply writer
// ---------------------------------------------------------------------------

/// Write one close-delimited HTTP/1.1 response: head first, then the body.
async fn write_reply(stream: &mut TcpStream, status: u16, content_type: &str, body: &str) {
    let mut head = format!("HTTP/1.1 {status} {}\r\n", reason_phrase(status));
    head.push_str(&format!("Content-Type: {content_type}\r\n"));
    head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    head.push_str("Connection: close\r\n");
    head.push_str("\r\n");

    if stream.write_all(head.as_bytes()).await.is_ok() {
        let _ = stream.write_all(body.as_bytes()).await;
    }
}

/// Reason phrases for the statuses this server emits.
fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Error",
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
