//! Positional pairing of listen and connect addresses.

use std::fmt;

use crate::address::Address;
use crate::error::TupleError;

/// One bridged endpoint pair: connections accepted on `listen` are forwarded
/// to `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    pub listen: Address,
    pub connect: Address,
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.listen, self.connect)
    }
}

/// Split both comma-separated lists and pair them by index.
///
/// Nothing is paired until every token in both lists has resolved, so a
/// failure never yields a partial tuple list.
///
/// # Errors
///
/// - [`TupleError::Missing`] if either list is empty.
/// - [`TupleError::LengthMismatch`] if the lists differ in length.
/// - [`TupleError::Address`] for the first token that fails to resolve.
pub fn build(listen_raw: &str, connect_raw: &str) -> Result<Vec<Tuple>, TupleError> {
    if listen_raw.is_empty() || connect_raw.is_empty() {
        return Err(TupleError::Missing);
    }

    let listen: Vec<&str> = listen_raw.split(',').collect();
    let connect: Vec<&str> = connect_raw.split(',').collect();
    if listen.len() != connect.len() {
        return Err(TupleError::LengthMismatch {
            listen: listen.len(),
            connect: connect.len(),
        });
    }

    listen
        .iter()
        .zip(&connect)
        .enumerate()
        .map(|(index, (&l, &c))| -> Result<Tuple, TupleError> {
            let resolve = |raw: &str| {
                Address::resolve(raw).map_err(|source| TupleError::Address { index, source })
            };
            Ok(Tuple {
                listen: resolve(l)?,
                connect: resolve(c)?,
            })
        })
        .collect()
}
