//! Wire protocol for the xatmi transaction middleware.
//!
//! Logical messages are split into fixed-capacity fragments for transport
//! and reassembled on the receiving side, keyed by correlation id.

pub mod constants;
mod complete;
mod fragment;
mod message;

pub use complete::Complete;
pub use constants::*;
pub use fragment::Fragment;
pub use message::{
    Connected, DirectiveReply, DirectiveRequest, Message, ProcessHandle, ResourceId,
};
