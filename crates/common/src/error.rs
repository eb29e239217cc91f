//! Error types for address resolution and tuple construction.
//!
//! Both are fatal to the caller: a daemon must never start with a partially
//! resolved endpoint list.

use std::num::ParseIntError;

use thiserror::Error;

/// A raw address token could not be resolved to either address family.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// The token is neither `host:port` nor `cid:port`.
    #[error("{raw:?} is neither an AF_INET nor an AF_VSOCK address")]
    UnknownFamily { raw: String },

    /// The context identifier is not an unsigned 32-bit integer.
    #[error("{raw:?}: couldn't turn CID into integer: {source}")]
    InvalidCid { raw: String, source: ParseIntError },

    /// The vsock port is not an unsigned 32-bit integer.
    #[error("{raw:?}: couldn't turn port into integer: {source}")]
    InvalidPort { raw: String, source: ParseIntError },
}

/// The listen/connect lists could not be paired into tuples.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TupleError {
    /// One or both lists are empty.
    #[error("VSOCK_INADDRS and VSOCK_OUTADDRS must both be set")]
    Missing,

    /// The lists split into different numbers of tokens.
    #[error(
        "VSOCK_INADDRS and VSOCK_OUTADDRS must contain same number of addresses (got {listen} and {connect})"
    )]
    LengthMismatch { listen: usize, connect: usize },

    /// A token at `index` failed to resolve.
    #[error("address #{index}: {source}")]
    Address {
        index: usize,
        #[source]
        source: AddressError,
    },
}
