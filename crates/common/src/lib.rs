//! Address model and tuple construction shared across the `vsock-proxy` binaries.

pub mod address;
pub mod cid;
pub mod error;
pub mod tuple;

pub use address::Address;
pub use error::{AddressError, TupleError};
pub use tuple::Tuple;
