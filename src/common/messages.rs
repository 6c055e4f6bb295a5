//! Serialize and deserialize Krpc messages.

mod internal;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::common::{Contact, Id, ID_SIZE, MAX_BUCKET_SIZE_K};
use crate::{Error, Result};

const NODE4_BYTE_SIZE: usize = ID_SIZE + 6;
const NODE6_BYTE_SIZE: usize = ID_SIZE + 18;

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    pub transaction_id: u16,

    /// The version of the requester or responder.
    pub version: Option<Vec<u8>>,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

/// Shared by every request and response.
#[derive(Debug, PartialEq, Clone)]
pub struct RpcHeader {
    /// The contact of the node sending this message, if it wants to be known.
    pub sender: Option<Contact>,
    /// Network partition tag, requests from other networks are rejected.
    pub network_id: String,
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestSpecific {
    Ping(PingRequest),
    FindNode(FindNodeRequest),
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    Ping(PingResponse),
    FindNode(FindNodeResponse),
}

// === PING ===

#[derive(Debug, PartialEq, Clone)]
pub struct PingRequest {
    pub header: RpcHeader,
}

#[derive(Debug, PartialEq, Clone)]
pub struct PingResponse {
    pub header: RpcHeader,
}

// === FIND_NODE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequest {
    pub header: RpcHeader,
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeResponse {
    pub header: RpcHeader,
    /// Closest contacts to the requested target, closest first.
    pub contacts: Vec<Contact>,
}

impl RequestSpecific {
    pub fn header(&self) -> &RpcHeader {
        match self {
            RequestSpecific::Ping(PingRequest { header }) => header,
            RequestSpecific::FindNode(FindNodeRequest { header, .. }) => header,
        }
    }

    /// The remote method name of this request.
    pub fn method(&self) -> &'static str {
        match self {
            RequestSpecific::Ping(_) => "ping",
            RequestSpecific::FindNode(_) => "find_node",
        }
    }
}

impl ResponseSpecific {
    pub fn header(&self) -> &RpcHeader {
        match self {
            ResponseSpecific::Ping(PingResponse { header }) => header,
            ResponseSpecific::FindNode(FindNodeResponse { header, .. }) => header,
        }
    }
}

impl Message {
    fn into_serde_message(self) -> internal::DHTMessage {
        internal::DHTMessage {
            transaction_id: self.transaction_id.to_be_bytes().to_vec(),
            version: self.version,
            variant: match self.message_type {
                MessageType::Request(request) => {
                    internal::DHTMessageVariant::Request(match request {
                        RequestSpecific::Ping(PingRequest { header }) => {
                            internal::DHTRequestSpecific::Ping {
                                arguments: ping_arguments(header),
                            }
                        }
                        RequestSpecific::FindNode(FindNodeRequest { header, target }) => {
                            let (id, addr) = sender_to_bytes(&header.sender);

                            internal::DHTRequestSpecific::FindNode {
                                arguments: internal::DHTFindNodeRequestArguments {
                                    id,
                                    addr,
                                    network_id: header.network_id,
                                    target: target.to_vec(),
                                },
                            }
                        }
                    })
                }

                MessageType::Response(response) => {
                    internal::DHTMessageVariant::Response(match response {
                        ResponseSpecific::Ping(PingResponse { header }) => {
                            internal::DHTResponseSpecific::Ping {
                                arguments: ping_arguments(header),
                            }
                        }
                        ResponseSpecific::FindNode(FindNodeResponse { header, contacts }) => {
                            let (id, addr) = sender_to_bytes(&header.sender);
                            let (nodes, nodes6) = contacts_to_bytes(&contacts);

                            internal::DHTResponseSpecific::FindNode {
                                arguments: internal::DHTFindNodeResponseArguments {
                                    id,
                                    addr,
                                    network_id: header.network_id,
                                    nodes,
                                    nodes6,
                                },
                            }
                        }
                    })
                }

                MessageType::Error(err) => {
                    internal::DHTMessageVariant::Error(internal::DHTErrorSpecific {
                        error_info: vec![
                            serde_bencode::value::Value::Int(err.code.into()),
                            serde_bencode::value::Value::Bytes(err.description.into()),
                        ],
                    })
                }
            },
        }
    }

    fn from_serde_message(msg: internal::DHTMessage) -> Result<Message> {
        Ok(Message {
            transaction_id: transaction_id(msg.transaction_id)?,
            version: msg.version,
            message_type: match msg.variant {
                internal::DHTMessageVariant::Request(request) => {
                    MessageType::Request(match request {
                        internal::DHTRequestSpecific::Ping { arguments } => {
                            RequestSpecific::Ping(PingRequest {
                                header: header_from_bytes(
                                    arguments.id,
                                    arguments.addr,
                                    arguments.network_id,
                                )?,
                            })
                        }
                        internal::DHTRequestSpecific::FindNode { arguments } => {
                            RequestSpecific::FindNode(FindNodeRequest {
                                header: header_from_bytes(
                                    arguments.id,
                                    arguments.addr,
                                    arguments.network_id,
                                )?,
                                target: Id::from_bytes(arguments.target)?,
                            })
                        }
                    })
                }

                internal::DHTMessageVariant::Response(response) => {
                    MessageType::Response(match response {
                        internal::DHTResponseSpecific::Ping { arguments } => {
                            ResponseSpecific::Ping(PingResponse {
                                header: header_from_bytes(
                                    arguments.id,
                                    arguments.addr,
                                    arguments.network_id,
                                )?,
                            })
                        }
                        internal::DHTResponseSpecific::FindNode { arguments } => {
                            let mut contacts = bytes_to_contacts(&arguments.nodes, NODE4_BYTE_SIZE)?;

                            if let Some(nodes6) = &arguments.nodes6 {
                                contacts.extend(bytes_to_contacts(nodes6, NODE6_BYTE_SIZE)?);
                            }

                            // A well behaved node never returns more than one bucket.
                            contacts.truncate(MAX_BUCKET_SIZE_K);

                            ResponseSpecific::FindNode(FindNodeResponse {
                                header: header_from_bytes(
                                    arguments.id,
                                    arguments.addr,
                                    arguments.network_id,
                                )?,
                                contacts,
                            })
                        }
                    })
                }

                internal::DHTMessageVariant::Error(err) => {
                    if err.error_info.len() < 2 {
                        return Err(Error::InvalidMessage(
                            "Error packet should have at least 2 elements",
                        ));
                    }

                    MessageType::Error(ErrorSpecific {
                        code: match err.error_info[0] {
                            serde_bencode::value::Value::Int(code) => match code.try_into() {
                                Ok(code) => code,
                                Err(_) => return Err(Error::InvalidMessage("error parsing error code")),
                            },
                            _ => {
                                return Err(Error::InvalidMessage(
                                    "Expected error code as first element",
                                ))
                            }
                        },
                        description: match &err.error_info[1] {
                            serde_bencode::value::Value::Bytes(desc) => {
                                String::from_utf8_lossy(desc).to_string()
                            }
                            _ => {
                                return Err(Error::InvalidMessage(
                                    "Expected description as second element",
                                ))
                            }
                        },
                    })
                }
            },
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        self.clone().into_serde_message().to_bytes()
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message> {
        Message::from_serde_message(internal::DHTMessage::from_bytes(bytes)?)
    }
}

// Return the transaction Id as a u16
pub fn transaction_id(bytes: Vec<u8>) -> Result<u16> {
    if bytes.len() == 2 {
        return Ok(((bytes[0] as u16) << 8) | (bytes[1] as u16));
    } else if bytes.len() == 1 {
        return Ok(bytes[0] as u16);
    }

    Err(Error::InvalidTransactionId(bytes))
}

fn ping_arguments(header: RpcHeader) -> internal::DHTPingArguments {
    let (id, addr) = sender_to_bytes(&header.sender);

    internal::DHTPingArguments {
        id,
        addr,
        network_id: header.network_id,
    }
}

fn sender_to_bytes(sender: &Option<Contact>) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
    match sender {
        Some(contact) => (
            Some(contact.id.to_vec()),
            Some(sockaddr_to_bytes(&contact.address)),
        ),
        None => (None, None),
    }
}

fn header_from_bytes(
    id: Option<Vec<u8>>,
    addr: Option<Vec<u8>>,
    network_id: String,
) -> Result<RpcHeader> {
    let sender = match (id, addr) {
        (Some(id), Some(addr)) => Some(Contact::new(
            Id::from_bytes(id)?,
            bytes_to_sockaddr(addr)?,
        )),
        (None, _) => None,
        (Some(_), None) => {
            return Err(Error::InvalidMessage("Sender id without an address"));
        }
    };

    Ok(RpcHeader { sender, network_id })
}

fn bytes_to_sockaddr<T: AsRef<[u8]>>(bytes: T) -> Result<SocketAddr> {
    let bytes = bytes.as_ref();
    match bytes.len() {
        6 => {
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);

            let port_bytes_as_array: [u8; 2] = bytes[4..6]
                .try_into()
                .map_err(|_| Error::InvalidMessage("wrong number of bytes for port"))?;

            let port: u16 = u16::from_be_bytes(port_bytes_as_array);

            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        18 => {
            let ip_bytes: [u8; 16] = bytes[0..16]
                .try_into()
                .map_err(|_| Error::InvalidMessage("wrong number of bytes for ipv6"))?;

            let port_bytes_as_array: [u8; 2] = bytes[16..18]
                .try_into()
                .map_err(|_| Error::InvalidMessage("wrong number of bytes for port"))?;

            let port: u16 = u16::from_be_bytes(port_bytes_as_array);

            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip_bytes)), port))
        }
        _ => Err(Error::InvalidMessage("Wrong number of bytes for sockaddr")),
    }
}

pub fn sockaddr_to_bytes(sockaddr: &SocketAddr) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(18);

    match sockaddr {
        SocketAddr::V4(v4) => bytes.extend(v4.ip().octets()),
        SocketAddr::V6(v6) => bytes.extend(v6.ip().octets()),
    }

    bytes.extend(sockaddr.port().to_be_bytes());

    bytes
}

/// Compact contacts encoding, IPv4 contacts in the first buffer, IPv6 in the second.
fn contacts_to_bytes(contacts: &[Contact]) -> (Vec<u8>, Option<Vec<u8>>) {
    let mut nodes = Vec::with_capacity(NODE4_BYTE_SIZE * contacts.len());
    let mut nodes6 = Vec::new();

    for contact in contacts {
        let buffer = match contact.address {
            SocketAddr::V4(_) => &mut nodes,
            SocketAddr::V6(_) => &mut nodes6,
        };

        buffer.extend(contact.id.as_bytes());
        buffer.extend(sockaddr_to_bytes(&contact.address));
    }

    (nodes, if nodes6.is_empty() { None } else { Some(nodes6) })
}

fn bytes_to_contacts(bytes: &[u8], node_byte_size: usize) -> Result<Vec<Contact>> {
    if bytes.len() % node_byte_size != 0 {
        return Err(Error::InvalidMessage("Wrong number of bytes for nodes message"));
    }

    bytes
        .chunks_exact(node_byte_size)
        .map(|chunk| {
            let id = Id::from_bytes(&chunk[..ID_SIZE])?;
            let address = bytes_to_sockaddr(&chunk[ID_SIZE..])?;

            Ok(Contact::new(id, address))
        })
        .collect()
}
