use std::collections::HashMap;
use std::net::SocketAddr;

use flume::Sender;

use crate::common::ResponseSpecific;
use crate::rpc::TransportError;

/// Delivers the outcome of a request to the thread waiting for it.
pub type ResponseSender = Sender<Result<ResponseSpecific, TransportError>>;

#[derive(Debug, Clone)]
pub struct InflightRequest {
    pub to: SocketAddr,
    pub sender: ResponseSender,
}

impl InflightRequest {
    pub fn new(to: SocketAddr, sender: ResponseSender) -> Self {
        Self { to, sender }
    }

    /// Same as SocketAddr::eq but ignores the ip if it is unspecified for testing reasons.
    pub fn does_match(&self, from: &SocketAddr) -> bool {
        if self.to.port() != from.port() {
            return false;
        }

        if self.to.ip().is_unspecified() {
            return true;
        }

        self.to.ip() == from.ip()
    }
}

#[derive(Debug, Default)]
/// Requests waiting for a response, by transaction_id.
pub struct InflightRequests {
    requests: HashMap<u16, InflightRequest>,
}

impl InflightRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Check if a transaction_id is still inflight
    pub fn contains(&self, transaction_id: u16) -> bool {
        self.requests.contains_key(&transaction_id)
    }

    pub fn insert(&mut self, transaction_id: u16, request: InflightRequest) {
        self.requests.insert(transaction_id, request);
    }

    /// Remove inflight request by transaction_id if it exists and was sent to `from`.
    pub fn remove_matching(
        &mut self,
        transaction_id: u16,
        from: &SocketAddr,
    ) -> Option<InflightRequest> {
        match self.requests.get(&transaction_id) {
            Some(request) if request.does_match(from) => self.requests.remove(&transaction_id),
            _ => None,
        }
    }

    /// Remove inflight request by transaction_id, regardless of who answered.
    pub fn remove(&mut self, transaction_id: u16) -> Option<InflightRequest> {
        self.requests.remove(&transaction_id)
    }

    /// Remove and return every inflight request.
    pub fn drain(&mut self) -> impl Iterator<Item = InflightRequest> + '_ {
        self.requests.drain().map(|(_, request)| request)
    }
}
