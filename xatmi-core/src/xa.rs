//! XA identifiers and constants from the X/Open XA specification.
//!
//! The transaction manager, the resource proxies and the wire protocol all
//! speak in terms of these values: flag words passed to the resource
//! manager's switch entry points, integer return codes used as branch
//! votes, and the [`Xid`] that names a global transaction and its branches.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, XatmiError};

// ============================================================================
// XA Flags
// ============================================================================

/// No flags set.
pub const XA_TMNOFLAGS: i64 = 0x0000_0000;

/// Caller is joining an existing transaction branch.
pub const XA_TMJOIN: i64 = 0x0020_0000;

/// Caller is resuming association with a suspended transaction branch.
pub const XA_TMRESUME: i64 = 0x0800_0000;

/// Dissociate caller from the transaction branch - successful.
pub const XA_TMSUCCESS: i64 = 0x0400_0000;

/// Dissociate caller from the transaction branch - failed.
pub const XA_TMFAIL: i64 = 0x2000_0000;

/// Caller is suspending (not ending) its association with the branch.
pub const XA_TMSUSPEND: i64 = 0x0200_0000;

/// Start a recovery scan.
pub const XA_TMSTARTRSCAN: i64 = 0x0100_0000;

/// End a recovery scan.
pub const XA_TMENDRSCAN: i64 = 0x0080_0000;

/// Use one-phase commit optimization.
pub const XA_TMONEPHASE: i64 = 0x4000_0000;

// ============================================================================
// XA Return Codes
// ============================================================================

/// Normal execution.
pub const XA_OK: i32 = 0;

/// The transaction branch was read-only and has been committed.
pub const XA_RDONLY: i32 = 3;

/// Routine returned with no effect and may be reissued.
pub const XA_RETRY: i32 = 4;

/// The work was partially committed and partially rolled back.
pub const XA_HEURMIX: i32 = 5;

/// The transaction work was rolled back heuristically.
pub const XA_HEURRB: i32 = 6;

/// The transaction work was committed heuristically.
pub const XA_HEURCOM: i32 = 7;

/// The work may have been committed or rolled back (heuristic hazard).
pub const XA_HEURHAZ: i32 = 8;

/// Base of the rollback-only error range.
pub const XA_RBBASE: i32 = 100;

/// Rollback for an unspecified reason.
pub const XA_RBROLLBACK: i32 = XA_RBBASE;

/// Rollback caused by a communication failure.
pub const XA_RBCOMMFAIL: i32 = XA_RBBASE + 1;

/// A deadlock was detected.
pub const XA_RBDEADLOCK: i32 = XA_RBBASE + 2;

/// A condition violating resource integrity was detected.
pub const XA_RBINTEGRITY: i32 = XA_RBBASE + 3;

/// Rollback for a reason not otherwise listed.
pub const XA_RBOTHER: i32 = XA_RBBASE + 4;

/// A protocol error occurred in the resource manager.
pub const XA_RBPROTO: i32 = XA_RBBASE + 5;

/// The transaction branch took too long.
pub const XA_RBTIMEOUT: i32 = XA_RBBASE + 6;

/// The branch may be retried.
pub const XA_RBTRANSIENT: i32 = XA_RBBASE + 7;

/// Upper bound of the rollback-only error range.
pub const XA_RBEND: i32 = XA_RBTRANSIENT;

// ============================================================================
// XAER Error Codes
// ============================================================================

/// Asynchronous operation already outstanding.
pub const XAER_ASYNC: i32 = -2;

/// A resource manager error occurred.
pub const XAER_RMERR: i32 = -3;

/// The XID is not valid.
pub const XAER_NOTA: i32 = -4;

/// Invalid arguments were given.
pub const XAER_INVAL: i32 = -5;

/// Routine invoked in an improper context.
pub const XAER_PROTO: i32 = -6;

/// Resource manager unavailable.
pub const XAER_RMFAIL: i32 = -7;

/// The XID already exists.
pub const XAER_DUPID: i32 = -8;

/// The resource manager is doing work outside the transaction.
pub const XAER_OUTSIDE: i32 = -9;

/// Returns true when the code counts as a "yes" vote during prepare.
///
/// `XA_RDONLY` commits the branch immediately, so it is an acceptable
/// outcome alongside `XA_OK`.
pub fn vote_is_ok(code: i32) -> bool {
    code == XA_OK || code == XA_RDONLY
}

// ============================================================================
// Transaction Identifier (Xid)
// ============================================================================

/// The format id carried by the null trid.
const NULL_FORMAT_ID: i64 = -1;

/// XA transaction identifier: format id, global transaction id, branch
/// qualifier.
///
/// Two branches of the same global transaction share the global part and
/// differ only in the branch qualifier. The null trid has an all-zero
/// global/branch part and is never a valid participant in the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    format_id: i64,
    gtrid: Vec<u8>,
    bqual: Vec<u8>,
}

impl Xid {
    /// Maximum length of the global transaction id.
    pub const MAX_GTRID_SIZE: usize = 64;
    /// Maximum length of the branch qualifier.
    pub const MAX_BQUAL_SIZE: usize = 64;

    /// Creates a new transaction identifier.
    ///
    /// Fails with a serialization error if either part exceeds the XA
    /// maximum of 64 bytes.
    pub fn new(format_id: i64, gtrid: &[u8], bqual: &[u8]) -> Result<Self> {
        if gtrid.len() > Self::MAX_GTRID_SIZE {
            return Err(XatmiError::Serialization(format!(
                "global transaction id exceeds {} bytes",
                Self::MAX_GTRID_SIZE
            )));
        }
        if bqual.len() > Self::MAX_BQUAL_SIZE {
            return Err(XatmiError::Serialization(format!(
                "branch qualifier exceeds {} bytes",
                Self::MAX_BQUAL_SIZE
            )));
        }

        Ok(Self {
            format_id,
            gtrid: gtrid.to_vec(),
            bqual: bqual.to_vec(),
        })
    }

    /// The null trid: empty global/branch part, format id -1.
    pub fn null() -> Self {
        Self {
            format_id: NULL_FORMAT_ID,
            gtrid: Vec::new(),
            bqual: Vec::new(),
        }
    }

    /// Allocates a fresh global transaction id with an empty branch
    /// qualifier.
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4();
        Self {
            format_id: 0,
            gtrid: uuid.as_bytes().to_vec(),
            bqual: Vec::new(),
        }
    }

    /// Returns true for the null trid.
    pub fn is_null(&self) -> bool {
        self.gtrid.is_empty() && self.bqual.is_empty()
    }

    /// Derives a branch of this global transaction.
    ///
    /// The result shares the global part and carries `sequence` as its
    /// branch qualifier, so every enlisted resource gets a distinct branch
    /// of the same global transaction.
    pub fn branch(&self, sequence: u64) -> Self {
        Self {
            format_id: self.format_id,
            gtrid: self.gtrid.clone(),
            bqual: sequence.to_le_bytes().to_vec(),
        }
    }

    /// Returns true when `other` is a branch of the same global
    /// transaction (equal global part, any branch qualifier).
    pub fn same_global(&self, other: &Xid) -> bool {
        self.format_id == other.format_id && self.gtrid == other.gtrid
    }

    /// Returns the format identifier.
    pub fn format_id(&self) -> i64 {
        self.format_id
    }

    /// Returns the global transaction identifier.
    pub fn gtrid(&self) -> &[u8] {
        &self.gtrid
    }

    /// Returns the branch qualifier.
    pub fn bqual(&self) -> &[u8] {
        &self.bqual
    }

    /// Serializes the trid for wire transmission.
    ///
    /// Layout: format id (i64 LE), gtrid length (u8), bqual length (u8),
    /// gtrid bytes, bqual bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(10 + self.gtrid.len() + self.bqual.len());
        bytes.extend_from_slice(&self.format_id.to_le_bytes());
        bytes.push(self.gtrid.len() as u8);
        bytes.push(self.bqual.len() as u8);
        bytes.extend_from_slice(&self.gtrid);
        bytes.extend_from_slice(&self.bqual);
        bytes
    }

    /// Deserializes a trid from its wire layout.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 10 {
            return Err(XatmiError::Serialization("trid data too short".to_string()));
        }

        let format_id = i64::from_le_bytes(
            bytes[0..8]
                .try_into()
                .map_err(|_| XatmiError::Serialization("trid header".to_string()))?,
        );
        let gtrid_len = bytes[8] as usize;
        let bqual_len = bytes[9] as usize;

        if gtrid_len > Self::MAX_GTRID_SIZE || bqual_len > Self::MAX_BQUAL_SIZE {
            return Err(XatmiError::Serialization(
                "trid part exceeds XA maximum".to_string(),
            ));
        }
        if bytes.len() < 10 + gtrid_len + bqual_len {
            return Err(XatmiError::Serialization(
                "trid data shorter than declared".to_string(),
            ));
        }

        Ok(Self {
            format_id,
            gtrid: bytes[10..10 + gtrid_len].to_vec(),
            bqual: bytes[10 + gtrid_len..10 + gtrid_len + bqual_len].to_vec(),
        })
    }

    /// Size of the wire representation.
    pub fn wire_size(&self) -> usize {
        10 + self.gtrid.len() + self.bqual.len()
    }
}

impl Default for Xid {
    fn default() -> Self {
        Self::null()
    }
}

impl std::fmt::Display for Xid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            return write!(f, "null");
        }
        for byte in &self.gtrid {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ":")?;
        for byte in &self.bqual {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
