//! Error types for xatmi operations.

use std::io;
use thiserror::Error;

/// The main error type shared by the xatmi crates.
#[derive(Debug, Error)]
pub enum XatmiError {
    /// Transport-level errors (destination absent, channel closed).
    #[error("transport error: {0}")]
    Transport(String),

    /// Protocol-level errors (malformed fragments, unknown message types).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration errors (bad resource setup, xa-switch mismatch).
    ///
    /// These are fatal at startup: a proxy cannot run against a resource
    /// it failed to open.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Operation or transaction timeout.
    #[error("timeout error: {0}")]
    Timeout(String),

    /// Durable decision-log failures.
    ///
    /// A coordinator that cannot write its decision record must stop;
    /// committing without a durable entry is never permitted.
    #[error("log error: {0}")]
    Log(String),

    /// I/O errors from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A specialized `Result` type for xatmi operations.
pub type Result<T> = std::result::Result<T, XatmiError>;
