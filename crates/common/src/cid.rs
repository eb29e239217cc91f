//! Query the vsock context identifier of the machine we are running on.

use std::io;

/// Returns the local context identifier.
///
/// # Errors
///
/// Returns an error if `/dev/vsock` is unavailable or the query fails, and
/// [`io::ErrorKind::Unsupported`] on non-Linux targets.
#[cfg(target_os = "linux")]
pub fn local_cid() -> io::Result<u32> {
    vsock::get_local_cid()
}

#[cfg(not(target_os = "linux"))]
pub fn local_cid() -> io::Result<u32> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "vsock is only available on Linux",
    ))
}

/// Render the operator-facing line printed by `-c`; empty when unresolvable.
pub fn describe(cid: io::Result<u32>) -> String {
    let cid = cid.map(|c| c.to_string()).unwrap_or_default();
    format!("CID is: {cid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_known_cid() {
        assert_eq!(describe(Ok(3)), "CID is: 3");
    }

    #[test]
    fn describe_unresolvable_cid_is_empty() {
        let err = io::Error::new(io::ErrorKind::NotFound, "no device");
        assert_eq!(describe(Err(err)), "CID is: ");
    }
}
