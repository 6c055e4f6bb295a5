use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::Contact;
use crate::Id;

use super::Kademlia;

/// Counters of inbound requests, updated by the listener thread.
#[derive(Debug, Default)]
pub struct Statistics {
    pings: AtomicU64,
    find_nodes: AtomicU64,
    rejected: AtomicU64,
}

impl Statistics {
    pub(crate) fn record_ping(&self) {
        self.pings.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_find_node(&self) {
        self.find_nodes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }
}

/// Information and statistics about this node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    contact: Contact,
    local_addr: SocketAddr,
    network_id: String,
    routing_table_size: usize,
    pings: u64,
    find_nodes: u64,
    rejected: u64,
}

impl Info {
    pub(crate) fn new(kademlia: &Kademlia, local_addr: SocketAddr) -> Self {
        let statistics = kademlia.statistics();

        Self {
            id: *kademlia.id(),
            contact: kademlia.contact().clone(),
            local_addr,
            network_id: kademlia.network_id().to_string(),
            routing_table_size: kademlia.routing_table_size(),
            pings: statistics.pings.load(Ordering::Relaxed),
            find_nodes: statistics.find_nodes.load(Ordering::Relaxed),
            rejected: statistics.rejected.load(Ordering::Relaxed),
        }
    }

    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }
    /// The contact this node advertises to others.
    pub fn contact(&self) -> &Contact {
        &self.contact
    }
    /// Local UDP socket address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    pub fn network_id(&self) -> &str {
        &self.network_id
    }
    /// Number of contacts in the routing table when this snapshot was taken.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }
    /// Accepted inbound ping requests.
    pub fn pings(&self) -> u64 {
        self.pings
    }
    /// Accepted inbound find_node requests.
    pub fn find_nodes(&self) -> u64 {
        self.find_nodes
    }
    /// Inbound requests rejected, for example from another network.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}
