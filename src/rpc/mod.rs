//! K-RPC node service: inbound handlers, outbound calls and iterative lookups.

pub(crate) mod config;
mod info;
mod iterative_query;
pub(crate) mod socket;
mod transport;

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;

use tracing::{debug, trace};

use crate::common::{
    Contact, FindNodeRequest, FindNodeResponse, Id, PingRequest, PingResponse, RequestSpecific,
    ResponseSpecific, RoutingTable, RpcHeader, UpdateOutcome,
};
use crate::{Error, Result};

pub use config::{Config, DEFAULT_NETWORK_ID, DEFAULT_PARALLELISM};
pub use info::{Info, Statistics};
pub use socket::{KrpcSocket, DEFAULT_PORT, DEFAULT_REQUEST_TIMEOUT};
pub use transport::{
    Server, Transport, TransportError, PROTOCOL_ERROR_CODE, SERVER_ERROR_CODE,
};

use iterative_query::IterativeFindNode;

/// A Kademlia node: answers ping and find_node requests, calls other nodes
/// through a [Transport], and keeps its [RoutingTable] up to date with every
/// node it hears from.
#[derive(Debug)]
pub struct Kademlia {
    contact: Contact,
    network_id: String,
    routing_table: Arc<RwLock<RoutingTable>>,
    transport: Arc<dyn Transport>,
    eviction_probe: bool,
    statistics: Statistics,
}

impl Kademlia {
    /// Create a node advertising `contact`, with an empty routing table.
    pub fn new(
        contact: Contact,
        network_id: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            routing_table: Arc::new(RwLock::new(RoutingTable::new(contact.id))),
            contact,
            network_id: network_id.into(),
            transport,
            eviction_probe: false,
            statistics: Statistics::default(),
        }
    }

    /// Ping the least recently seen contact of a full bucket before dropping
    /// a newcomer, see [RoutingTable::update_or_probe].
    pub fn with_eviction_probe(mut self, eviction_probe: bool) -> Self {
        self.eviction_probe = eviction_probe;
        self
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.contact.id
    }

    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// A snapshot of the routing table.
    pub fn routing_table(&self) -> RoutingTable {
        self.read_table().clone()
    }

    pub fn routing_table_size(&self) -> usize {
        self.read_table().size()
    }

    /// The header attached to every message this node sends.
    pub fn header(&self) -> RpcHeader {
        RpcHeader {
            sender: Some(self.contact.clone()),
            network_id: self.network_id.clone(),
        }
    }

    // === Inbound ===

    /// Validate an inbound request header, remember its sender and return
    /// the header for the response.
    ///
    /// A request from another network is rejected without touching the routing table.
    pub fn handle_rpc(&self, header: &RpcHeader) -> Result<RpcHeader> {
        if header.network_id != self.network_id {
            self.statistics.record_rejected();

            return Err(Error::NetworkMismatch {
                expected: self.network_id.clone(),
                got: header.network_id.clone(),
            });
        }

        if let Some(sender) = &header.sender {
            self.update_routing_table(sender.clone());
        }

        Ok(self.header())
    }

    pub fn ping(&self, request: &PingRequest) -> Result<PingResponse> {
        let header = self.handle_rpc(&request.header)?;
        self.statistics.record_ping();

        debug!(sender = ?request.header.sender, "Received ping");

        Ok(PingResponse { header })
    }

    /// Answer with up to [crate::MAX_BUCKET_SIZE_K] contacts closest
    /// to the target, which may include the requester itself.
    pub fn find_node(&self, request: &FindNodeRequest) -> Result<FindNodeResponse> {
        let header = self.handle_rpc(&request.header)?;
        self.statistics.record_find_node();

        Ok(FindNodeResponse {
            header,
            contacts: self.read_table().closest(&request.target),
        })
    }

    // === Outbound ===

    /// Send `request` to `contact`, adding it to the routing table only if it answered.
    pub fn call(&self, contact: &Contact, request: RequestSpecific) -> Result<ResponseSpecific> {
        let method = request.method();

        match self.transport.request(contact.address, request) {
            Ok(response) => {
                self.update_routing_table(contact.clone());
                Ok(response)
            }
            Err(error) => {
                trace!(?contact, method, %error, "Call failed");
                Err(error.into())
            }
        }
    }

    /// Ping a known contact.
    pub fn ping_contact(&self, contact: &Contact) -> Result<()> {
        let request = RequestSpecific::Ping(PingRequest {
            header: self.header(),
        });

        match self.call(contact, request)? {
            ResponseSpecific::Ping(_) => Ok(()),
            ResponseSpecific::FindNode(_) => Err(TransportError::UnexpectedResponse("ping").into()),
        }
    }

    /// Ping an address whose id is unknown, like a bootstrap node,
    /// and add the node that answered to the routing table.
    pub fn ping_address(&self, address: SocketAddr) -> Result<Contact> {
        let request = RequestSpecific::Ping(PingRequest {
            header: self.header(),
        });

        let response = self.transport.request(address, request)?;

        let contact = match response {
            ResponseSpecific::Ping(PingResponse {
                header: RpcHeader {
                    sender: Some(sender),
                    ..
                },
            }) => Contact::new(sender.id, address),
            ResponseSpecific::Ping(_) => {
                return Err(Error::InvalidMessage("Ping response without a sender"))
            }
            ResponseSpecific::FindNode(_) => {
                return Err(TransportError::UnexpectedResponse("ping").into())
            }
        };

        self.update_routing_table(contact.clone());

        Ok(contact)
    }

    /// Ask `contact` for the contacts it knows closest to `target`.
    pub fn send_find_node(&self, contact: &Contact, target: Id) -> Result<Vec<Contact>> {
        let request = RequestSpecific::FindNode(FindNodeRequest {
            header: self.header(),
            target,
        });

        match self.call(contact, request)? {
            ResponseSpecific::FindNode(response) => Ok(response.contacts),
            ResponseSpecific::Ping(_) => {
                Err(TransportError::UnexpectedResponse("find_node").into())
            }
        }
    }

    /// Find the [crate::MAX_BUCKET_SIZE_K] closest reachable contacts
    /// to `target`, keeping up to `parallelism` find_node requests inflight.
    ///
    /// Blocks until every discovered contact was queried, so it always terminates
    /// as long as the transport eventually answers or times out.
    pub fn iterative_find_node(&self, target: Id, parallelism: usize) -> Vec<Contact> {
        let mut lookup = IterativeFindNode::new(*self.id(), target, parallelism);

        let seed = self.read_table().closest(&target);
        for contact in seed {
            lookup.add_candidate(contact);
        }

        lookup.run(|contact| match self.send_find_node(contact, target) {
            Ok(contacts) => Some(contacts),
            Err(error) => {
                debug!(?contact, ?target, %error, "find_node failed");
                None
            }
        })
    }

    // === Private Methods ===

    fn update_routing_table(&self, contact: Contact) {
        let outcome = if self.eviction_probe {
            write(&self.routing_table).update_or_probe(contact)
        } else {
            write(&self.routing_table).update(contact)
        };

        if let UpdateOutcome::ProbeStalest(stalest) = outcome {
            self.probe(stalest);
        }
    }

    /// Ping `stalest` on its own thread, so an inbound request never waits on it,
    /// then evict or keep it.
    fn probe(&self, stalest: Contact) {
        let stalest_id = stalest.id;
        let transport = self.transport.clone();
        let routing_table = self.routing_table.clone();
        let request = RequestSpecific::Ping(PingRequest {
            header: self.header(),
        });

        let spawned = thread::Builder::new()
            .name("kadnode-probe".to_string())
            .spawn(move || {
                let responsive = transport.request(stalest.address, request).is_ok();
                debug!(?stalest, responsive, "Eviction probe done");

                write(&routing_table).resolve_probe(&stalest.id, responsive);
            });

        if let Err(error) = spawned {
            debug!(?error, "Failed to spawn eviction probe, keeping the stalest contact");
            write(&self.routing_table).resolve_probe(&stalest_id, true);
        }
    }

    fn read_table(&self) -> RwLockReadGuard<'_, RoutingTable> {
        self.routing_table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn write(routing_table: &RwLock<RoutingTable>) -> RwLockWriteGuard<'_, RoutingTable> {
    routing_table
        .write()
        .unwrap_or_else(PoisonError::into_inner)
}

impl Server for Kademlia {
    fn handle_request(&self, from: SocketAddr, request: RequestSpecific) -> Result<ResponseSpecific> {
        trace!(?from, method = request.method(), "Handling request");

        match request {
            RequestSpecific::Ping(request) => self.ping(&request).map(ResponseSpecific::Ping),
            RequestSpecific::FindNode(request) => {
                self.find_node(&request).map(ResponseSpecific::FindNode)
            }
        }
    }
}
