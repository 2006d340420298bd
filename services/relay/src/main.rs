// synapse-relay: store-and-forward signal relay node for a UDP mesh.
//
// Wiring order: config → store → engine → tickers → datagram loop. The
// shutdown path flips the watch channel so every ticker stops before the
// store is dropped; in-flight buffer retries run to completion.

use serde_json::json;
use std::path::Path;
use std::time::Duration;
use synapse_relay::config;
use synapse_relay::engine::RelayEngine;
use synapse_relay::events::topics;
use synapse_relay::status_http::{StatusServer, SubsystemStatus};
use synapse_relay::storage::Store;
use synapse_relay::tumbler::Tumbler;
use synapse_relay::{heartbeat, udp};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "synapse-relay starting");

    // Optional config path as the sole CLI argument.
    let cfg = match std::env::args().nth(1) {
        Some(path) => config::load_config_from_path(Path::new(&path)),
        None => config::load_config(),
    };
    let cfg = match cfg {
        Ok(cfg) => {
            info!(
                port = cfg.port,
                peers = cfg.peer_ports.len(),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    // Open the store, creating its directory on first run.
    let store_path = Path::new(&cfg.store.sqlite_path);
    if let Some(parent) = store_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let store = match Store::open(store_path) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("FATAL: failed to open store at {}: {e}", store_path.display());
            std::process::exit(1);
        }
    };

    let engine = RelayEngine::new(&cfg, store);
    let tumbler = Tumbler::new(&cfg.signals.incoming);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Status HTTP endpoint (read-only, local).
    match StatusServer::start(
        &cfg.status_http.bind,
        env!("CARGO_PKG_VERSION").to_owned(),
        SubsystemStatus::ready(),
        engine.clone(),
    )
    .await
    {
        Ok(server) => info!(addr = %server.local_addr(), "status HTTP listening"),
        Err(e) => error!(error = %e, "status HTTP failed to start, continuing without it"),
    }

    // Buffer retry ticker.
    {
        let engine = engine.clone();
        let mut shutdown = shutdown_rx.clone();
        let tick = Duration::from_millis(cfg.buffer.retry_tick_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match engine.buffer().process_buffer().await {
                            Ok(outcome) if outcome.attempted > 0 || outcome.expired > 0 => {
                                info!(
                                    attempted = outcome.attempted,
                                    delivered = outcome.delivered,
                                    expired = outcome.expired,
                                    "buffer pass complete"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!(error = %e, "buffer pass failed");
                                engine.events().emit(
                                    topics::ERROR,
                                    json!({ "message": e.to_string(), "source": "buffer" }),
                                );
                            }
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // Stats rollup ticker.
    {
        let engine = engine.clone();
        let mut shutdown = shutdown_rx.clone();
        let tick = Duration::from_millis(cfg.stats_aggregation_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            // Skip the immediate first tick; there is nothing to roll up yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = engine.stats().run_rollup().await {
                            error!(error = %e, "stats rollup failed");
                            engine.events().emit(
                                topics::ERROR,
                                json!({ "message": e.to_string(), "source": "stats" }),
                            );
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // Retention cleanup ticker.
    {
        let engine = engine.clone();
        let mut shutdown = shutdown_rx.clone();
        let tick = Duration::from_millis(cfg.retention.cleanup_interval_ms.max(1));
        let horizon = cfg.retention.horizon_hours;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = engine.prune_history(horizon).await {
                            error!(error = %e, "retention cleanup failed");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // Heartbeat ticker.
    tokio::spawn(heartbeat::run(
        engine.clone(),
        cfg.heartbeat_peers(),
        cfg.heartbeat_interval_ms,
        shutdown_rx.clone(),
    ));

    // Inbound datagram loop on the main task.
    let socket = match tokio::net::UdpSocket::bind(("0.0.0.0", cfg.port)).await {
        Ok(socket) => socket,
        Err(e) => {
            eprintln!("FATAL: failed to bind UDP port {}: {e}", cfg.port);
            std::process::exit(1);
        }
    };

    let dispatcher = tokio::spawn(udp::run(
        engine.clone(),
        tumbler,
        socket,
        shutdown_rx.clone(),
    ));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    // Stop tickers and the dispatcher before the store drops.
    let _ = shutdown_tx.send(true);
    let _ = dispatcher.await;
    info!("synapse-relay stopped");
}
