//! Typed messages of the transaction protocol and their binary codec.
//!
//! The protocol is a closed set: every message kind is a variant of
//! [`Message`], dispatched with an exhaustive `match`. Adding a message
//! means adding a variant, a type constant and the codec arms; the
//! compiler then points at every dispatch site that needs updating.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, XatmiError};
use crate::xa::Xid;

use super::constants::*;

/// Well-known address of one process in the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessHandle(Uuid);

impl ProcessHandle {
    /// Allocates a fresh process handle.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing identifier.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying identifier.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one configured resource-manager entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId(i32);

impl ResourceId {
    /// Wraps a resource-manager id.
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    /// Returns the raw id passed to the XA switch.
    pub fn value(&self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rm-{}", self.0)
    }
}

/// Connect report sent by a resource proxy to the manager at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connected {
    /// The proxy process that opened the resource.
    pub process: ProcessHandle,
    /// The resource the proxy serves.
    pub resource: ResourceId,
    /// The `xa_open` outcome.
    pub state: i32,
}

/// A prepare/commit/rollback directive for one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectiveRequest {
    /// The branch trid the directive applies to.
    pub trid: Xid,
    /// The resource addressed.
    pub resource: ResourceId,
    /// XA flags forwarded to the switch entry point.
    pub flags: i64,
}

/// The outcome of one branch directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectiveReply {
    /// The proxy process that executed the call.
    pub process: ProcessHandle,
    /// The resource that voted.
    pub resource: ResourceId,
    /// The branch trid.
    pub trid: Xid,
    /// The verbatim XA return code.
    pub code: i32,
    /// Microseconds spent inside the XA call itself, measured at the
    /// proxy; the manager separates this from the transport round trip.
    pub elapsed_us: u64,
}

/// Every message of the transaction protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Proxy startup report.
    ResourceConnect(Connected),
    /// Prepare one resource branch.
    PrepareRequest(DirectiveRequest),
    /// Prepare vote.
    PrepareReply(DirectiveReply),
    /// Commit one resource branch.
    CommitRequest(DirectiveRequest),
    /// Commit outcome.
    CommitReply(DirectiveReply),
    /// Roll back one resource branch.
    RollbackRequest(DirectiveRequest),
    /// Rollback outcome.
    RollbackReply(DirectiveReply),
    /// Prepare a remote domain acting as one super-branch.
    DomainPrepareRequest(DirectiveRequest),
    /// Remote domain prepare vote.
    DomainPrepareReply(DirectiveReply),
    /// Commit a remote domain branch.
    DomainCommitRequest(DirectiveRequest),
    /// Remote domain commit outcome.
    DomainCommitReply(DirectiveReply),
    /// Roll back a remote domain branch.
    DomainRollbackRequest(DirectiveRequest),
    /// Remote domain rollback outcome.
    DomainRollbackReply(DirectiveReply),
    /// Process exit notification from the domain manager.
    ProcessDown {
        /// The process that exited.
        process: ProcessHandle,
    },
    /// Graceful shutdown directive.
    Shutdown,
}

impl Message {
    /// Returns the wire type constant for this message.
    pub fn message_type(&self) -> u32 {
        match self {
            Message::ResourceConnect(_) => RESOURCE_CONNECT,
            Message::PrepareRequest(_) => RESOURCE_PREPARE_REQUEST,
            Message::PrepareReply(_) => RESOURCE_PREPARE_REPLY,
            Message::CommitRequest(_) => RESOURCE_COMMIT_REQUEST,
            Message::CommitReply(_) => RESOURCE_COMMIT_REPLY,
            Message::RollbackRequest(_) => RESOURCE_ROLLBACK_REQUEST,
            Message::RollbackReply(_) => RESOURCE_ROLLBACK_REPLY,
            Message::DomainPrepareRequest(_) => DOMAIN_PREPARE_REQUEST,
            Message::DomainPrepareReply(_) => DOMAIN_PREPARE_REPLY,
            Message::DomainCommitRequest(_) => DOMAIN_COMMIT_REQUEST,
            Message::DomainCommitReply(_) => DOMAIN_COMMIT_REPLY,
            Message::DomainRollbackRequest(_) => DOMAIN_ROLLBACK_REQUEST,
            Message::DomainRollbackReply(_) => DOMAIN_ROLLBACK_REPLY,
            Message::ProcessDown { .. } => PROCESS_DOWN,
            Message::Shutdown => SHUTDOWN_REQUEST,
        }
    }

    /// Encodes the message body.
    ///
    /// Field order is fixed and little-endian throughout; the message type
    /// travels in the fragment header, not the body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::ResourceConnect(connected) => {
                buf.put_slice(connected.process.as_uuid().as_bytes());
                buf.put_i32_le(connected.resource.value());
                buf.put_i32_le(connected.state);
            }
            Message::PrepareRequest(request)
            | Message::CommitRequest(request)
            | Message::RollbackRequest(request)
            | Message::DomainPrepareRequest(request)
            | Message::DomainCommitRequest(request)
            | Message::DomainRollbackRequest(request) => {
                buf.put_slice(&request.trid.to_bytes());
                buf.put_i32_le(request.resource.value());
                buf.put_i64_le(request.flags);
            }
            Message::PrepareReply(reply)
            | Message::CommitReply(reply)
            | Message::RollbackReply(reply)
            | Message::DomainPrepareReply(reply)
            | Message::DomainCommitReply(reply)
            | Message::DomainRollbackReply(reply) => {
                buf.put_slice(reply.process.as_uuid().as_bytes());
                buf.put_i32_le(reply.resource.value());
                buf.put_slice(&reply.trid.to_bytes());
                buf.put_i32_le(reply.code);
                buf.put_u64_le(reply.elapsed_us);
            }
            Message::ProcessDown { process } => {
                buf.put_slice(process.as_uuid().as_bytes());
            }
            Message::Shutdown => {}
        }
        buf.freeze()
    }

    /// Decodes a message body for the given wire type.
    pub fn decode(message_type: u32, body: &[u8]) -> Result<Message> {
        let mut reader = Reader::new(body);
        let message = match message_type {
            RESOURCE_CONNECT => Message::ResourceConnect(Connected {
                process: ProcessHandle::from_uuid(reader.uuid()?),
                resource: ResourceId::new(reader.i32()?),
                state: reader.i32()?,
            }),
            RESOURCE_PREPARE_REQUEST => Message::PrepareRequest(reader.request()?),
            RESOURCE_PREPARE_REPLY => Message::PrepareReply(reader.reply()?),
            RESOURCE_COMMIT_REQUEST => Message::CommitRequest(reader.request()?),
            RESOURCE_COMMIT_REPLY => Message::CommitReply(reader.reply()?),
            RESOURCE_ROLLBACK_REQUEST => Message::RollbackRequest(reader.request()?),
            RESOURCE_ROLLBACK_REPLY => Message::RollbackReply(reader.reply()?),
            DOMAIN_PREPARE_REQUEST => Message::DomainPrepareRequest(reader.request()?),
            DOMAIN_PREPARE_REPLY => Message::DomainPrepareReply(reader.reply()?),
            DOMAIN_COMMIT_REQUEST => Message::DomainCommitRequest(reader.request()?),
            DOMAIN_COMMIT_REPLY => Message::DomainCommitReply(reader.reply()?),
            DOMAIN_ROLLBACK_REQUEST => Message::DomainRollbackRequest(reader.request()?),
            DOMAIN_ROLLBACK_REPLY => Message::DomainRollbackReply(reader.reply()?),
            PROCESS_DOWN => Message::ProcessDown {
                process: ProcessHandle::from_uuid(reader.uuid()?),
            },
            SHUTDOWN_REQUEST => Message::Shutdown,
            other => {
                return Err(XatmiError::Protocol(format!(
                    "unknown message type {:#010x}",
                    other
                )))
            }
        };

        if reader.remaining() != 0 {
            return Err(XatmiError::Serialization(format!(
                "{} trailing bytes after message type {:#010x}",
                reader.remaining(),
                message_type
            )));
        }
        Ok(message)
    }
}

/// Bounds-checked reader over a message body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(XatmiError::Serialization(
                "message body too short".to_string(),
            ));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i64(&mut self) -> Result<i64> {
        let bytes = self.take(8)?;
        Ok(i64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    fn uuid(&mut self) -> Result<Uuid> {
        let bytes = self.take(16)?;
        let mut array = [0u8; 16];
        array.copy_from_slice(bytes);
        Ok(Uuid::from_bytes(array))
    }

    fn xid(&mut self) -> Result<Xid> {
        // The trid header declares its own length.
        let header = self.take(10)?;
        let gtrid_len = header[8] as usize;
        let bqual_len = header[9] as usize;
        let body = self.take(gtrid_len + bqual_len)?;

        let mut bytes = Vec::with_capacity(10 + body.len());
        bytes.extend_from_slice(header);
        bytes.extend_from_slice(body);
        Xid::from_bytes(&bytes)
    }

    fn request(&mut self) -> Result<DirectiveRequest> {
        Ok(DirectiveRequest {
            trid: self.xid()?,
            resource: ResourceId::new(self.i32()?),
            flags: self.i64()?,
        })
    }

    fn reply(&mut self) -> Result<DirectiveReply> {
        Ok(DirectiveReply {
            process: ProcessHandle::from_uuid(self.uuid()?),
            resource: ResourceId::new(self.i32()?),
            trid: self.xid()?,
            code: self.i32()?,
            elapsed_us: self.u64()?,
        })
    }
}
