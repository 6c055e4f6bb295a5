//! UDP socket layer managing incoming/outgoing requests and responses.

mod inflight_requests;

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace};

use crate::common::{ErrorSpecific, Message, MessageType, RequestSpecific, ResponseSpecific};

use super::config::Config;
use super::transport::{Server, Transport, TransportError};
use inflight_requests::{InflightRequest, InflightRequests};

const VERSION: [u8; 4] = [75, 78, 0, 1]; // "KN" version 01
const MTU: usize = 2048;

pub const DEFAULT_PORT: u16 = 6881;
/// Default request timeout before abandoning an inflight request to a non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000); // 2 seconds
/// The maximum duration the listener blocks on an empty [UdpSocket] before
/// checking whether it was shut down.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(100);

/// A UdpSocket wrapper that formats and correlates requests and responses.
///
/// Outbound requests block the calling thread until the listener thread,
/// started by [KrpcSocket::serve], delivers the matching response.
#[derive(Debug)]
pub struct KrpcSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
    next_tid: AtomicU16,
    request_timeout: Duration,
    inflight_requests: Mutex<InflightRequests>,
    shutdown: AtomicBool,
}

impl KrpcSocket {
    pub(crate) fn new(config: &Config) -> Result<Self, std::io::Error> {
        let bind_address = config.bind_address;

        let socket = if let Some(port) = config.port {
            UdpSocket::bind(SocketAddr::new(bind_address, port))?
        } else {
            match UdpSocket::bind(SocketAddr::new(bind_address, DEFAULT_PORT)) {
                Ok(socket) => Ok(socket),
                Err(_) => UdpSocket::bind(SocketAddr::new(bind_address, 0)),
            }?
        };

        socket.set_read_timeout(Some(MAX_THREAD_BLOCK_DURATION))?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            next_tid: AtomicU16::new(0),
            request_timeout: config.request_timeout,
            inflight_requests: Mutex::new(InflightRequests::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    // === Getters ===

    /// Returns the address the server is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // === Public Methods ===

    /// Spawn the listener thread, answering requests with `server` and
    /// delivering responses to waiting [Transport::request] calls.
    pub fn serve(self: &Arc<Self>, server: Arc<dyn Server>) -> std::io::Result<JoinHandle<()>> {
        let socket = self.clone();

        thread::Builder::new()
            .name(format!("kadnode-{}", self.local_addr))
            .spawn(move || socket.listen(server.as_ref()))
    }

    /// Stop the listener thread and fail every inflight request.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    // === Private Methods ===

    fn listen(&self, server: &dyn Server) {
        let mut buf = [0u8; MTU];

        while !self.is_shutdown() {
            match self.socket.recv_from(&mut buf) {
                Ok((amt, from)) => self.handle_packet(server, &buf[..amt], from),
                Err(ref e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => {
                    trace!(
                        context = "socket_error",
                        ?e,
                        "recv_from failed unexpectedly"
                    );
                }
            }
        }

        for request in self.inflight().drain() {
            let _ = request.sender.send(Err(TransportError::Shutdown));
        }

        debug!(local_addr = ?self.local_addr, "Listener stopped");
    }

    fn handle_packet(&self, server: &dyn Server, bytes: &[u8], from: SocketAddr) {
        if from.port() == 0 {
            trace!(
                context = "socket_validation",
                message = "Packet from port 0"
            );
            return;
        }

        let message = match Message::from_bytes(bytes) {
            Ok(message) => message,
            Err(error) => {
                trace!(
                    context = "socket_error",
                    ?error,
                    ?from,
                    message = ?String::from_utf8_lossy(bytes),
                    "Received invalid Bencode message."
                );
                return;
            }
        };

        trace!(context = "socket_message_receiving", ?message, ?from);

        let transaction_id = message.transaction_id;

        match message.message_type {
            MessageType::Request(request) => {
                let method = request.method();

                let message_type = match server.handle_request(from, request) {
                    Ok(response) => MessageType::Response(response),
                    Err(error) => {
                        debug!(?from, method, %error, "Rejected request");
                        MessageType::Error(ErrorSpecific::from(&error))
                    }
                };

                let _ = self
                    .send(from, self.message(transaction_id, message_type))
                    .map_err(|e| {
                        debug!(?e, "Error sending response message");
                    });
            }
            MessageType::Response(response) => {
                self.deliver(transaction_id, &from, Ok(response));
            }
            MessageType::Error(error) => {
                self.deliver(
                    transaction_id,
                    &from,
                    Err(TransportError::Remote {
                        code: error.code,
                        description: error.description,
                    }),
                );
            }
        }
    }

    /// Hand a response or error message to the thread waiting for it.
    fn deliver(
        &self,
        transaction_id: u16,
        from: &SocketAddr,
        result: Result<ResponseSpecific, TransportError>,
    ) {
        match self.inflight().remove_matching(transaction_id, from) {
            Some(request) => {
                // The requester may have timed out in the meantime.
                let _ = request.sender.send(result);
            }
            None => {
                trace!(
                    context = "socket_validation",
                    message = "Unexpected response id or address"
                );
            }
        }
    }

    /// Reserve a transaction_id that is not inflight.
    fn insert_inflight(&self, request: InflightRequest) -> u16 {
        let mut inflight = self.inflight();

        // Ids wrap around, and are only reused after their request is done.
        let transaction_id = loop {
            let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
            if !inflight.contains(tid) {
                break tid;
            }
        };

        inflight.insert(transaction_id, request);
        transaction_id
    }

    fn inflight(&self) -> MutexGuard<'_, InflightRequests> {
        self.inflight_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn message(&self, transaction_id: u16, message_type: MessageType) -> Message {
        Message {
            transaction_id,
            version: Some(VERSION.to_vec()),
            message_type,
        }
    }

    /// Send a raw message
    fn send(&self, address: SocketAddr, message: Message) -> Result<(), TransportError> {
        self.socket.send_to(&message.to_bytes()?, address)?;
        trace!(context = "socket_message_sending", message = ?message);
        Ok(())
    }
}

impl Transport for KrpcSocket {
    fn request(
        &self,
        address: SocketAddr,
        request: RequestSpecific,
    ) -> Result<ResponseSpecific, TransportError> {
        if self.is_shutdown() {
            return Err(TransportError::Shutdown);
        }

        let (sender, receiver) = flume::bounded(1);
        let transaction_id = self.insert_inflight(InflightRequest::new(address, sender));

        let message = self.message(transaction_id, MessageType::Request(request));

        if let Err(error) = self.send(address, message) {
            self.inflight().remove(transaction_id);
            return Err(error);
        }

        match receiver.recv_timeout(self.request_timeout) {
            Ok(result) => result,
            Err(flume::RecvTimeoutError::Timeout) => {
                self.inflight().remove(transaction_id);
                Err(TransportError::Timeout(address))
            }
            Err(flume::RecvTimeoutError::Disconnected) => Err(TransportError::Shutdown),
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use crate::common::{Contact, PingRequest, PingResponse, RpcHeader};
    use crate::{Error, Id};

    use super::*;

    #[derive(Debug)]
    struct EchoServer {
        contact: Contact,
    }

    impl Server for EchoServer {
        fn handle_request(
            &self,
            _from: SocketAddr,
            request: RequestSpecific,
        ) -> Result<ResponseSpecific, Error> {
            if request.header().network_id != "test" {
                return Err(Error::NetworkMismatch {
                    expected: "test".to_string(),
                    got: request.header().network_id.clone(),
                });
            }

            Ok(ResponseSpecific::Ping(PingResponse {
                header: RpcHeader {
                    sender: Some(self.contact.clone()),
                    network_id: "test".to_string(),
                },
            }))
        }
    }

    fn config(request_timeout: Duration) -> Config {
        Config {
            bind_address: Ipv4Addr::LOCALHOST.into(),
            port: Some(0),
            request_timeout,
            ..Default::default()
        }
    }

    fn ping(network_id: &str) -> RequestSpecific {
        RequestSpecific::Ping(PingRequest {
            header: RpcHeader {
                sender: None,
                network_id: network_id.to_string(),
            },
        })
    }

    fn echo_server() -> (Arc<KrpcSocket>, Contact) {
        let socket = Arc::new(KrpcSocket::new(&config(DEFAULT_REQUEST_TIMEOUT)).unwrap());
        let contact = Contact::new(Id::random(), socket.local_addr());

        socket
            .serve(Arc::new(EchoServer {
                contact: contact.clone(),
            }))
            .unwrap();

        (socket, contact)
    }

    #[test]
    fn request_response() {
        let (server, contact) = echo_server();

        let client = Arc::new(KrpcSocket::new(&config(DEFAULT_REQUEST_TIMEOUT)).unwrap());
        client
            .serve(Arc::new(EchoServer {
                contact: Contact::random(),
            }))
            .unwrap();

        let response = client.request(server.local_addr(), ping("test")).unwrap();

        assert_eq!(response.header().sender, Some(contact));
        assert!(client.inflight().is_empty());

        server.shutdown();
        client.shutdown();
    }

    #[test]
    fn remote_error() {
        let (server, _) = echo_server();

        let client = Arc::new(KrpcSocket::new(&config(DEFAULT_REQUEST_TIMEOUT)).unwrap());
        client
            .serve(Arc::new(EchoServer {
                contact: Contact::random(),
            }))
            .unwrap();

        let result = client.request(server.local_addr(), ping("other"));

        assert!(matches!(
            result,
            Err(TransportError::Remote { code: 203, .. })
        ));

        server.shutdown();
        client.shutdown();
    }

    #[test]
    fn request_timeout() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();

        let client = Arc::new(KrpcSocket::new(&config(Duration::from_millis(100))).unwrap());
        client
            .serve(Arc::new(EchoServer {
                contact: Contact::random(),
            }))
            .unwrap();

        let address = silent.local_addr().unwrap();
        let result = client.request(address, ping("test"));

        assert!(matches!(result, Err(TransportError::Timeout(to)) if to == address));
        assert!(client.inflight().is_empty());

        client.shutdown();
    }

    #[test]
    fn request_after_shutdown() {
        let (server, _) = echo_server();
        server.shutdown();

        let result = server.request(server.local_addr(), ping("test"));

        assert!(matches!(result, Err(TransportError::Shutdown)));
    }

    #[test]
    fn transaction_ids_wrap_around() {
        let socket = KrpcSocket::new(&config(DEFAULT_REQUEST_TIMEOUT)).unwrap();
        socket.next_tid.store(u16::MAX, Ordering::Relaxed);

        let (sender, _receiver) = flume::bounded(1);
        let address = socket.local_addr();

        assert_eq!(
            socket.insert_inflight(InflightRequest::new(address, sender.clone())),
            u16::MAX
        );
        assert_eq!(
            socket.insert_inflight(InflightRequest::new(address, sender.clone())),
            0
        );

        // Skips ids that are still inflight.
        socket.next_tid.store(u16::MAX, Ordering::Relaxed);
        assert_eq!(
            socket.insert_inflight(InflightRequest::new(address, sender)),
            1
        );
    }
}
