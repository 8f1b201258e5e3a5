//! Protocol constants for the xatmi transport and transaction protocol.

/// Size of the fragment length field in bytes.
pub const SIZE_OF_FRAGMENT_LENGTH_FIELD: usize = 4;

/// Size of the message type field in bytes.
pub const SIZE_OF_MESSAGE_TYPE_FIELD: usize = 4;

/// Size of the correlation id field in bytes.
pub const SIZE_OF_CORRELATION_FIELD: usize = 16;

/// Size of the complete-size field in bytes.
pub const SIZE_OF_COMPLETE_SIZE_FIELD: usize = 4;

/// Size of the payload offset field in bytes.
pub const SIZE_OF_OFFSET_FIELD: usize = 4;

/// Total fragment header size (everything before the payload, excluding
/// the leading length field).
pub const FRAGMENT_HEADER_SIZE: usize = SIZE_OF_MESSAGE_TYPE_FIELD
    + SIZE_OF_CORRELATION_FIELD
    + SIZE_OF_COMPLETE_SIZE_FIELD
    + SIZE_OF_OFFSET_FIELD;

/// Maximum payload bytes one transport fragment can carry.
///
/// Fixed platform constant: a logical message larger than this is split
/// across several fragments and reassembled by the receiver.
pub const MAX_FRAGMENT_PAYLOAD: usize = 1024;

// Message type constants. The high byte groups messages by subsystem, the
// low byte distinguishes request (0x01) from reply (0x02).

/// Resource proxy connect report (proxy to manager, at startup).
pub const RESOURCE_CONNECT: u32 = 0x0001_0100;

/// Resource prepare request.
pub const RESOURCE_PREPARE_REQUEST: u32 = 0x0002_0001;

/// Resource prepare reply.
pub const RESOURCE_PREPARE_REPLY: u32 = 0x0002_0002;

/// Resource commit request.
pub const RESOURCE_COMMIT_REQUEST: u32 = 0x0003_0001;

/// Resource commit reply.
pub const RESOURCE_COMMIT_REPLY: u32 = 0x0003_0002;

/// Resource rollback request.
pub const RESOURCE_ROLLBACK_REQUEST: u32 = 0x0004_0001;

/// Resource rollback reply.
pub const RESOURCE_ROLLBACK_REPLY: u32 = 0x0004_0002;

/// Domain prepare request (addressed to a remote domain's manager).
pub const DOMAIN_PREPARE_REQUEST: u32 = 0x0005_0001;

/// Domain prepare reply.
pub const DOMAIN_PREPARE_REPLY: u32 = 0x0005_0002;

/// Domain commit request.
pub const DOMAIN_COMMIT_REQUEST: u32 = 0x0006_0001;

/// Domain commit reply.
pub const DOMAIN_COMMIT_REPLY: u32 = 0x0006_0002;

/// Domain rollback request.
pub const DOMAIN_ROLLBACK_REQUEST: u32 = 0x0007_0001;

/// Domain rollback reply.
pub const DOMAIN_ROLLBACK_REPLY: u32 = 0x0007_0002;

/// Process exit notification from the domain manager.
pub const PROCESS_DOWN: u32 = 0x0008_0001;

/// Graceful shutdown directive honored by every dispatch loop.
pub const SHUTDOWN_REQUEST: u32 = 0x0009_0001;
