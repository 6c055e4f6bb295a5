//! Dht node.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::common::{Contact, Id, RoutingTable};
use crate::rpc::{Config, Info, Kademlia, KrpcSocket, Transport};
use crate::Result;

/// Network id used by [Testnet] nodes.
pub const TESTNET_NETWORK_ID: &str = "kadnode-testnet";
/// Request timeout used by [Testnet] nodes, everything is on loopback.
pub const TESTNET_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug)]
/// A Kademlia node listening on a UDP socket.
///
/// Requests are answered on a background thread, while lookups and pings
/// block the calling thread until done.
pub struct Dht {
    kademlia: Arc<Kademlia>,
    socket: Arc<KrpcSocket>,
    handle: Option<JoinHandle<()>>,
    bootstrap: Vec<String>,
    parallelism: usize,
}

#[derive(Debug, Default, Clone)]
/// Dht builder
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Set this node's [Id] instead of a random one.
    pub fn id(mut self, id: Id) -> Self {
        self.0.id = Some(id);

        self
    }

    /// Set the network id, see [Config::network_id].
    pub fn network_id(mut self, network_id: &str) -> Self {
        self.0.network_id = network_id.to_string();

        self
    }

    /// Set the local ip to bind to.
    pub fn bind_address(mut self, bind_address: IpAddr) -> Self {
        self.0.bind_address = bind_address;

        self
    }

    /// Set the port to listen on.
    pub fn port(mut self, port: u16) -> Self {
        self.0.port = Some(port);

        self
    }

    /// Set the address advertised to other nodes.
    pub fn public_address(mut self, public_address: SocketAddr) -> Self {
        self.0.public_address = Some(public_address);

        self
    }

    /// Set bootstrapping nodes, as `host:port` strings.
    pub fn bootstrap(mut self, bootstrap: &[String]) -> Self {
        self.0.bootstrap = bootstrap.to_vec();

        self
    }

    /// Set the request timeout.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.0.request_timeout = request_timeout;

        self
    }

    /// Set the number of concurrent requests per lookup.
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.0.parallelism = parallelism;

        self
    }

    /// Probe the stalest contact of a full bucket before dropping a newcomer.
    pub fn eviction_probe(mut self, eviction_probe: bool) -> Self {
        self.0.eviction_probe = eviction_probe;

        self
    }

    /// Create a Dht node.
    pub fn build(self) -> Result<Dht> {
        Dht::new(self.0)
    }
}

impl Dht {
    /// Create a new Dht node, listening on the configured socket.
    ///
    /// Does not contact any bootstrap node, see [Dht::bootstrap].
    pub fn new(config: Config) -> Result<Self> {
        let socket = Arc::new(KrpcSocket::new(&config)?);
        let local_addr = socket.local_addr();

        let address = config
            .public_address
            .unwrap_or_else(|| advertised_address(local_addr));
        let id = config.id.unwrap_or_else(Id::random);

        let transport: Arc<dyn Transport> = socket.clone();
        let kademlia = Arc::new(
            Kademlia::new(Contact::new(id, address), config.network_id, transport)
                .with_eviction_probe(config.eviction_probe),
        );

        let handle = socket.serve(kademlia.clone())?;

        info!(?id, ?local_addr, ?address, network_id = kademlia.network_id(), "Dht node listening");

        Ok(Dht {
            kademlia,
            socket,
            handle: Some(handle),
            bootstrap: config.bootstrap,
            parallelism: config.parallelism,
        })
    }

    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    // === Getters ===

    /// This node's [Id]
    pub fn id(&self) -> &Id {
        self.kademlia.id()
    }

    /// The contact this node advertises to others.
    pub fn contact(&self) -> &Contact {
        self.kademlia.contact()
    }

    /// Local UDP socket address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Information and statistics about this node.
    pub fn info(&self) -> Info {
        Info::new(&self.kademlia, self.local_addr())
    }

    /// A snapshot of the routing table.
    pub fn routing_table(&self) -> RoutingTable {
        self.kademlia.routing_table()
    }

    // === Public Methods ===

    /// Ping a node by address, returning its contact if it answered.
    pub fn ping(&self, address: SocketAddr) -> Result<Contact> {
        self.kademlia.ping_address(address)
    }

    /// Find the closest reachable contacts to `target` with the configured parallelism.
    pub fn find_node(&self, target: Id) -> Vec<Contact> {
        self.kademlia
            .iterative_find_node(target, self.parallelism)
    }

    /// Same as [Dht::find_node] with an explicit number of concurrent requests.
    pub fn iterative_find_node(&self, target: Id, parallelism: usize) -> Vec<Contact> {
        self.kademlia.iterative_find_node(target, parallelism)
    }

    /// Ping every bootstrap node, then look up this node's own id to
    /// populate the routing table.
    ///
    /// Returns true if the routing table is not empty afterwards.
    pub fn bootstrap(&self) -> bool {
        for address in to_socket_address(&self.bootstrap) {
            if let Err(error) = self.kademlia.ping_address(address) {
                debug!(?address, %error, "Bootstrap node did not respond");
            }
        }

        let closest = self.find_node(*self.id());
        let table_size = self.kademlia.routing_table_size();

        if table_size == 0 {
            error!("Could not bootstrap the routing table");
            return false;
        }

        debug!(table_size, closest = closest.len(), "Bootstrapped the routing table");

        true
    }

    /// Stop answering requests and wait for the listener thread to exit.
    ///
    /// Outbound requests fail with [crate::rpc::TransportError::Shutdown] afterwards.
    pub fn shutdown(&mut self) {
        self.socket.shutdown();

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            debug!(id = ?self.id(), "Dht node shut down");
        }
    }
}

impl Drop for Dht {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The local address as other nodes can reach it, with an unspecified ip replaced by loopback.
fn advertised_address(local_addr: SocketAddr) -> SocketAddr {
    match local_addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), local_addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), local_addr.port())
        }
        _ => local_addr,
    }
}

fn to_socket_address<T: AsRef<str>>(bootstrap: &[T]) -> Vec<SocketAddr> {
    bootstrap
        .iter()
        .flat_map(|s| match s.as_ref().to_socket_addrs() {
            Ok(addresses) => addresses.collect::<Vec<_>>(),
            Err(error) => {
                debug!(address = s.as_ref(), %error, "Could not resolve bootstrap node");
                Vec::new()
            }
        })
        .collect()
}

/// Create a testnet of Dht nodes to run tests against instead of a real network.
#[derive(Debug)]
pub struct Testnet {
    pub bootstrap: Vec<String>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    /// Create `count` nodes on loopback, each bootstrapping from the first one.
    pub fn new(count: usize) -> Result<Testnet> {
        let mut nodes: Vec<Dht> = vec![];
        let mut bootstrap = vec![];

        for i in 0..count {
            let builder = Dht::builder()
                .network_id(TESTNET_NETWORK_ID)
                .bind_address(Ipv4Addr::LOCALHOST.into())
                .port(0)
                .request_timeout(TESTNET_REQUEST_TIMEOUT);

            if i == 0 {
                let node = builder.build()?;
                bootstrap.push(node.local_addr().to_string());

                nodes.push(node)
            } else {
                let node = builder.bootstrap(&bootstrap).build()?;
                node.bootstrap();

                nodes.push(node)
            }
        }

        Ok(Testnet { bootstrap, nodes })
    }
}

#[cfg(test)]
mod test {
    use crate::common::MAX_BUCKET_SIZE_K;
    use crate::rpc::TransportError;
    use crate::Error;

    use super::*;

    #[test]
    fn bind_twice() {
        let a = Dht::builder().port(0).build().unwrap();
        let result = Dht::builder()
            .bind_address(a.local_addr().ip())
            .port(a.local_addr().port())
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn advertises_loopback_for_unspecified() {
        let dht = Dht::builder().port(0).build().unwrap();

        assert_eq!(dht.contact().address.ip(), IpAddr::from(Ipv4Addr::LOCALHOST));
        assert_eq!(dht.contact().address.port(), dht.local_addr().port());
    }

    #[test]
    fn public_address() {
        let public_address: SocketAddr = "203.0.113.1:4000".parse().unwrap();
        let dht = Dht::builder()
            .port(0)
            .public_address(public_address)
            .build()
            .unwrap();

        assert_eq!(dht.contact().address, public_address);
        assert_eq!(dht.info().contact().address, public_address);
    }

    #[test]
    fn bootstrap_without_nodes() {
        let dht = Dht::builder().port(0).build().unwrap();

        assert!(!dht.bootstrap());
        assert!(dht.routing_table().is_empty());
    }

    #[test]
    fn ping() {
        let testnet = Testnet::new(2).unwrap();

        let contact = testnet.nodes[1]
            .ping(testnet.nodes[0].local_addr())
            .unwrap();

        assert_eq!(contact.id, *testnet.nodes[0].id());
        assert!(testnet.nodes[0].info().pings() >= 1);
    }

    #[test]
    fn bootstrap_populates_routing_tables() {
        let testnet = Testnet::new(10).unwrap();

        for node in &testnet.nodes {
            let table = node.routing_table();

            assert!(!table.is_empty());
            assert!(!table.contains(node.id()));
        }

        // The bootstrap node heard from everyone.
        assert_eq!(testnet.nodes[0].routing_table().size(), 9);
    }

    #[test]
    fn find_node() {
        let testnet = Testnet::new(10).unwrap();

        let target = *testnet.nodes[3].id();
        let closest = testnet.nodes[9].find_node(target);

        assert_eq!(closest.len(), 9);
        assert_eq!(&closest[0], testnet.nodes[3].contact());
        assert!(!closest.contains(testnet.nodes[9].contact()));
        assert!(closest.len() <= MAX_BUCKET_SIZE_K);
    }

    #[test]
    fn find_node_skips_shutdown_node() {
        let mut testnet = Testnet::new(5).unwrap();

        let target = *testnet.nodes[2].id();
        testnet.nodes[2].shutdown();

        let closest = testnet.nodes[4].find_node(target);

        assert!(!closest.contains(testnet.nodes[2].contact()));
        assert_eq!(closest.len(), 3);
    }

    #[test]
    fn network_mismatch() {
        let testnet = Testnet::new(2).unwrap();
        let stranger = Dht::builder()
            .network_id("another-network")
            .bind_address(Ipv4Addr::LOCALHOST.into())
            .port(0)
            .build()
            .unwrap();

        let result = stranger.ping(testnet.nodes[0].local_addr());

        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::Remote { code: 203, .. }))
        ));
        assert!(!testnet.nodes[0].routing_table().contains(stranger.id()));
        assert_eq!(testnet.nodes[0].info().rejected(), 1);
        assert!(stranger.routing_table().is_empty());
    }

    #[test]
    fn shutdown() {
        let mut testnet = Testnet::new(2).unwrap();

        testnet.nodes[1].shutdown();

        let result = testnet.nodes[1].ping(testnet.nodes[0].local_addr());

        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::Shutdown))
        ));
    }
}
