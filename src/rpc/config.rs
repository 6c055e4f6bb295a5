use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::Id;

use super::socket::DEFAULT_REQUEST_TIMEOUT;

/// Network id used when none is configured.
pub const DEFAULT_NETWORK_ID: &str = "kadnode";
/// Number of concurrent requests an iterative lookup keeps in flight.
pub const DEFAULT_PARALLELISM: usize = 3;

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// This node's identifier.
    ///
    /// Defaults to None, where a random [Id] is generated.
    pub id: Option<Id>,
    /// Nodes only answer requests tagged with their own network id.
    ///
    /// Defaults to [DEFAULT_NETWORK_ID]
    pub network_id: String,
    /// Local ip to bind the UDP socket to.
    ///
    /// Defaults to `0.0.0.0`
    pub bind_address: IpAddr,
    /// Explicit port to listen on.
    ///
    /// Defaults to None, trying [super::socket::DEFAULT_PORT] first and
    /// falling back to a random port.
    pub port: Option<u16>,
    /// The address advertised to other nodes in every message.
    ///
    /// Defaults to None, where the local socket address is advertised,
    /// with an unspecified ip replaced by loopback.
    pub public_address: Option<SocketAddr>,
    /// Bootstrap nodes, as `host:port` strings.
    ///
    /// Defaults to an empty list, there is no public kadnode network.
    pub bootstrap: Vec<String>,
    /// UDP socket request timeout duration.
    ///
    /// A lookup only finishes once every request it sent was answered
    /// or timed out, so this bounds how long an unreachable node can stall it.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Concurrent requests per iterative lookup, `0` behaves as `1`.
    ///
    /// Defaults to [DEFAULT_PARALLELISM]
    pub parallelism: usize,
    /// Ping the least recently seen contact of a full bucket before
    /// dropping a new contact, replacing it if it does not answer.
    ///
    /// Defaults to false, where new contacts for a full bucket are dropped.
    pub eviction_probe: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: None,
            network_id: DEFAULT_NETWORK_ID.to_string(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: None,
            public_address: None,
            bootstrap: Vec::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            parallelism: DEFAULT_PARALLELISM,
            eviction_probe: false,
        }
    }
}
