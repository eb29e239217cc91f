//! Resolution of a single textual address into one of the two supported
//! address families.
//!
//! A token is first tried as a conventional `host:port` network address; only
//! when that fails is it read as a vsock `cid:port` pair. `3:8080` is therefore
//! a vsock address (a bare number is not a hostname), while `127.0.0.1:8080`
//! and `localhost:8080` are network addresses.

use std::fmt;
use std::net::SocketAddr;

use crate::error::AddressError;

/// One endpoint of a bridged tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// Conventional socket address. `host` may be an IP literal or a DNS name
    /// and is resolved when the engine binds or dials. An empty host means
    /// "unspecified".
    Network { host: String, port: u16 },

    /// Hypervisor-guest socket addressed by context identifier.
    Guest { cid: u32, port: u32 },
}

impl Address {
    /// Resolve `raw` into an [`Address`].
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] if `raw` is neither a network address nor
    /// exactly two `:`-separated unsigned 32-bit integers.
    pub fn resolve(raw: &str) -> Result<Self, AddressError> {
        if let Some(addr) = parse_network(raw) {
            return Ok(addr);
        }

        let fields: Vec<&str> = raw.split(':').collect();
        let &[cid, port] = fields.as_slice() else {
            return Err(AddressError::UnknownFamily { raw: raw.into() });
        };
        let cid = cid.parse::<u32>().map_err(|source| AddressError::InvalidCid {
            raw: raw.into(),
            source,
        })?;
        let port = port
            .parse::<u32>()
            .map_err(|source| AddressError::InvalidPort {
                raw: raw.into(),
                source,
            })?;
        Ok(Self::Guest { cid, port })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Self::Network { host, port } => write!(f, "{host}:{port}"),
            Self::Guest { cid, port } => write!(f, "vsock://{cid}:{port}"),
        }
    }
}

fn parse_network(raw: &str) -> Option<Address> {
    if let Ok(sock) = raw.parse::<SocketAddr>() {
        return Some(Address::Network {
            host: sock.ip().to_string(),
            port: sock.port(),
        });
    }

    let (host, port) = raw.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    if !host.is_empty() && !is_hostname(host) {
        return None;
    }
    Some(Address::Network {
        host: host.into(),
        port,
    })
}

/// RFC 1123 hostname that is not purely numeric.
fn is_hostname(host: &str) -> bool {
    if host.len() > 253 || host.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return false;
    }
    host.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}
