//! Main Crate Error

use crate::common::DecodeIdError;
use crate::rpc::TransportError;

#[derive(thiserror::Error, Debug)]
/// Kadnode crate error enum.
pub enum Error {
    /// An identifier that does not decode to exactly 20 bytes.
    #[error(transparent)]
    MalformedIdentifier(#[from] DecodeIdError),

    /// An inbound request tagged with another network's id.
    #[error("Expected network ID {expected}, got {got}")]
    NetworkMismatch { expected: String, got: String },

    /// Dialing, sending to, or receiving from a remote node failed,
    /// or the remote node answered with an error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// Errors related to parsing DHT messages.
    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    /// A well formed bencode packet that is not a valid message.
    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),

    /// Indicates that the message transaction_id is not two bytes.
    #[error("Invalid transaction_id: {0:?}")]
    InvalidTransactionId(Vec<u8>),
}
