//! Wire-level types for the xatmi transaction middleware.
//!
//! This crate carries everything both sides of the transaction protocol
//! agree on: the XA constants and [`Xid`] transaction identifier, the
//! transport [`protocol::Fragment`] and its reassembly into complete typed
//! messages, and the binary codec for the protocol message set. The
//! processes that speak the protocol (transaction manager, resource
//! proxies, remote domains) live in `xatmi-tm`.

#![warn(missing_docs)]

pub mod error;
pub mod protocol;
pub mod xa;

pub use error::{Result, XatmiError};
pub use protocol::{Message, ProcessHandle, ResourceId};
pub use xa::Xid;
