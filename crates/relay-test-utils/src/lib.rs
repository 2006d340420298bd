// relay-test-utils: Shared test utilities for the relay suite.
//
// Provides a mock UDP peer that records every decoded frame it receives,
// for integration testing of the relay node's delivery and retry paths.

pub mod mock_udp_peer;

pub use mock_udp_peer::MockUdpPeer;
