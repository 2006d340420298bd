// synapse-relay: store-and-forward signal relay node for a UDP mesh.
//
// The engine handle in `engine` owns every shared resource (store, peer map,
// socket, event bus, delivery callback); all exported operations are methods
// on it. Leaf modules stay transport-free so they are testable in isolation.

pub mod buffer;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod events;
pub mod handlers;
pub mod heartbeat;
pub mod model;
pub mod rules;
pub mod stats;
pub mod status_http;
pub mod storage;
pub mod tools;
pub mod tumbler;
pub mod udp;

pub use engine::RelayEngine;
