//! The seams between the node service and the network.

use std::fmt::Debug;
use std::net::SocketAddr;

use crate::common::{ErrorSpecific, RequestSpecific, ResponseSpecific};
use crate::Error;

/// Server error code, see [BEP_0005](https://www.bittorrent.org/beps/bep_0005.html).
pub const SERVER_ERROR_CODE: i32 = 202;
/// Protocol error code, used for requests from another network.
pub const PROTOCOL_ERROR_CODE: i32 = 203;

/// Request/response transport used for outbound calls.
pub trait Transport: Debug + Send + Sync {
    /// Send a request to `address` and block until its response, an error
    /// response, or a failure to deliver it.
    ///
    /// Implementations must return eventually, an unresponsive node should
    /// resolve to [TransportError::Timeout].
    fn request(
        &self,
        address: SocketAddr,
        request: RequestSpecific,
    ) -> Result<ResponseSpecific, TransportError>;
}

/// Handles inbound requests delivered by a transport.
pub trait Server: Debug + Send + Sync {
    /// Handle an incoming request from `from`.
    ///
    /// Returns the response to send back, or an error that the transport
    /// reports back to the requester as an error message.
    ///
    /// This function will block the transport's listener, thus it needs to be
    /// fast and must not wait on outbound requests.
    fn handle_request(
        &self,
        from: SocketAddr,
        request: RequestSpecific,
    ) -> Result<ResponseSpecific, Error>;
}

#[derive(thiserror::Error, Debug)]
/// Outbound request failures.
pub enum TransportError {
    /// The remote node did not respond within the request timeout.
    #[error("Request to {0} timed out")]
    Timeout(SocketAddr),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// The request could not be encoded.
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_bencode::Error),

    /// The remote node answered with an error message.
    #[error("Remote error {code}: {description}")]
    Remote { code: i32, description: String },

    /// The remote node answered with the wrong kind of response.
    #[error("Unexpected response to a {0} request")]
    UnexpectedResponse(&'static str),

    /// The transport stopped listening for responses.
    #[error("Transport is shut down")]
    Shutdown,
}

impl From<&Error> for ErrorSpecific {
    fn from(error: &Error) -> Self {
        let code = match error {
            Error::NetworkMismatch { .. } => PROTOCOL_ERROR_CODE,
            _ => SERVER_ERROR_CODE,
        };

        ErrorSpecific {
            code,
            description: error.to_string(),
        }
    }
}
