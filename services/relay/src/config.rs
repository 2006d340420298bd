//! Node configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/synapse-relay/relay.toml`. An absent file is
//! not an error; every field has a built-in default.
//!
//! # Optional fields
//! Everything defaults; `schema_version` must equal 1 when a file is
//! present. `retry_intervals_ms` must be non-empty.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub schema_version: u32,
    /// Name stamped as `sender` on every emitted frame.
    pub node_name: String,
    /// UDP listen port.
    pub port: u16,
    /// Peer names that receive heartbeats. Empty = every mapped peer.
    pub peers: Vec<String>,
    /// Peer name → UDP port on loopback.
    pub peer_ports: HashMap<String, u16>,
    pub signals: SignalsConfig,
    pub buffer: BufferSectionConfig,
    /// Stats rollup tick, ms.
    pub stats_aggregation_interval_ms: u64,
    /// Heartbeat tick, ms.
    pub heartbeat_interval_ms: u64,
    pub delivery: DeliveryConfig,
    pub store: StoreConfig,
    pub status_http: StatusHttpConfig,
    pub retention: RetentionConfig,
}

/// Signal-type whitelists as hex strings (e.g. `"0x50"`). `incoming` gates
/// admission; `outgoing` is advisory only.
#[derive(Debug, Clone, Default)]
pub struct SignalsConfig {
    pub incoming: Vec<String>,
    pub outgoing: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BufferSectionConfig {
    pub max_size: i64,
    pub ttl_hours: i64,
    pub max_retries: i64,
    pub retry_intervals_ms: Vec<i64>,
    /// Buffer retry tick, ms.
    pub retry_tick_ms: u64,
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Post-send window for catching ICMP-refused, ms. 0 disables probing.
    pub probe_ms: u64,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub sqlite_path: String,
}

#[derive(Debug, Clone)]
pub struct StatusHttpConfig {
    pub bind: String,
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub horizon_hours: i64,
    pub cleanup_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            schema_version: 1,
            node_name: "synapse-relay".to_owned(),
            port: 3025,
            peers: Vec::new(),
            peer_ports: HashMap::new(),
            signals: SignalsConfig::default(),
            buffer: BufferSectionConfig {
                max_size: 1000,
                ttl_hours: 24,
                max_retries: 3,
                retry_intervals_ms: vec![1000, 5000, 15000],
                retry_tick_ms: 5000,
            },
            stats_aggregation_interval_ms: 3_600_000,
            heartbeat_interval_ms: 30_000,
            delivery: DeliveryConfig { probe_ms: 150 },
            store: StoreConfig {
                sqlite_path: "/var/lib/synapse-relay/relay.sqlite3".to_owned(),
            },
            status_http: StatusHttpConfig {
                bind: "127.0.0.1:8080".to_owned(),
            },
            retention: RetentionConfig {
                horizon_hours: 168,
                cleanup_interval_ms: 3_600_000,
            },
        }
    }
}

impl Config {
    /// Heartbeat targets: the configured `peers` list, or every mapped peer
    /// when the list is empty.
    pub fn heartbeat_peers(&self) -> Vec<String> {
        if self.peers.is_empty() {
            self.peer_ports.keys().cloned().collect()
        } else {
            self.peers.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    node_name: Option<String>,
    port: Option<u16>,
    peers: Option<Vec<String>>,
    peer_ports: Option<HashMap<String, u16>>,
    signals: Option<RawSignals>,
    buffer_config: Option<RawBufferConfig>,
    stats_aggregation_interval_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    delivery: Option<RawDelivery>,
    store: Option<RawStore>,
    status_http: Option<RawStatusHttp>,
    retention: Option<RawRetention>,
}

#[derive(Debug, Deserialize)]
struct RawSignals {
    incoming: Option<Vec<String>>,
    outgoing: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawBufferConfig {
    max_size: Option<i64>,
    ttl_hours: Option<i64>,
    max_retries: Option<i64>,
    retry_intervals_ms: Option<Vec<i64>>,
    retry_tick_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawDelivery {
    probe_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawStore {
    sqlite_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStatusHttp {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRetention {
    horizon_hours: Option<i64>,
    cleanup_interval_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from the default path `/etc/synapse-relay/relay.toml`,
/// falling back to built-in defaults when the file is absent.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from_path(Path::new("/etc/synapse-relay/relay.toml"))
}

/// Load config from a custom path. A missing file yields the defaults; a
/// present-but-invalid file is an error.
pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let defaults = Config::default();

    let schema_version = raw.schema_version.unwrap_or(1);
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let signals = match raw.signals {
        Some(s) => SignalsConfig {
            incoming: s.incoming.unwrap_or_default(),
            outgoing: s.outgoing.unwrap_or_default(),
        },
        None => SignalsConfig::default(),
    };

    let buffer = match raw.buffer_config {
        Some(b) => BufferSectionConfig {
            max_size: b.max_size.unwrap_or(defaults.buffer.max_size),
            ttl_hours: b.ttl_hours.unwrap_or(defaults.buffer.ttl_hours),
            max_retries: b.max_retries.unwrap_or(defaults.buffer.max_retries),
            retry_intervals_ms: b
                .retry_intervals_ms
                .unwrap_or_else(|| defaults.buffer.retry_intervals_ms.clone()),
            retry_tick_ms: b.retry_tick_ms.unwrap_or(defaults.buffer.retry_tick_ms),
        },
        None => defaults.buffer.clone(),
    };
    if buffer.retry_intervals_ms.is_empty() {
        return Err(ConfigError::InvalidValue(
            "buffer_config.retry_intervals_ms must not be empty".to_owned(),
        ));
    }
    if buffer.ttl_hours < 0 {
        return Err(ConfigError::InvalidValue(
            "buffer_config.ttl_hours must not be negative".to_owned(),
        ));
    }

    let peers = raw.peers.unwrap_or_default();
    let peer_ports = raw.peer_ports.unwrap_or_default();
    for peer in &peers {
        if !peer_ports.contains_key(peer) {
            tracing::warn!(peer = %peer, "peer has no entry in peer_ports; sends to it will fail");
        }
    }

    Ok(Config {
        schema_version,
        node_name: raw.node_name.unwrap_or(defaults.node_name),
        port: raw.port.unwrap_or(defaults.port),
        peers,
        peer_ports,
        signals,
        buffer,
        stats_aggregation_interval_ms: raw
            .stats_aggregation_interval_ms
            .unwrap_or(defaults.stats_aggregation_interval_ms),
        heartbeat_interval_ms: raw
            .heartbeat_interval_ms
            .unwrap_or(defaults.heartbeat_interval_ms),
        delivery: match raw.delivery {
            Some(d) => DeliveryConfig {
                probe_ms: d.probe_ms.unwrap_or(defaults.delivery.probe_ms),
            },
            None => defaults.delivery.clone(),
        },
        store: match raw.store {
            Some(s) => StoreConfig {
                sqlite_path: s.sqlite_path.unwrap_or(defaults.store.sqlite_path),
            },
            None => defaults.store.clone(),
        },
        status_http: match raw.status_http {
            Some(s) => StatusHttpConfig {
                bind: s.bind.unwrap_or(defaults.status_http.bind),
            },
            None => defaults.status_http.clone(),
        },
        retention: match raw.retention {
            Some(r) => RetentionConfig {
                horizon_hours: r.horizon_hours.unwrap_or(defaults.retention.horizon_hours),
                cleanup_interval_ms: r
                    .cleanup_interval_ms
                    .unwrap_or(defaults.retention.cleanup_interval_ms),
            },
            None => defaults.retention.clone(),
        },
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "Parse error: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
