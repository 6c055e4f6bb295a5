#![doc = include_str!("../README.md")]

// Public modules
mod common;
mod dht;
mod error;
pub mod rpc;

pub use crate::common::{
    messages, Contact, DecodeIdError, Id, KBucket, PendingEviction, RoutingTable, UpdateOutcome,
    ID_BITS, ID_SIZE, MAX_BUCKET_SIZE_K,
};
pub use dht::{Dht, DhtBuilder, Testnet, TESTNET_NETWORK_ID, TESTNET_REQUEST_TIMEOUT};
pub use error::Error;

/// Alias Result to be the crate Result.
pub type Result<T, E = Error> = core::result::Result<T, E>;
