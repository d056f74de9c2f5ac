//! vdisk error types

use thiserror::Error;

/// The main error type for vdisk operations
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error on the host byte store or socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cookie/signature/magic mismatch, or checksum mismatch with every
    /// fallback copy already exhausted
    #[error("Invalid format: {0}")]
    Format(String),

    /// File shorter than its metadata implies
    #[error("Truncated image: {0}")]
    Truncated(String),

    /// Non-sector-aligned I/O against an aligned-only stream
    #[error("Unaligned access: {0}")]
    Unaligned(String),

    /// Read/write past the logical length, or an unsupported resize
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Unexpected opcode, bad status sequence, Reject PDU, malformed
    /// negotiation value
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Login failure or unsupported authentication method
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Target-indicated SCSI command failure
    #[error("SCSI command failed with status 0x{status:02x}")]
    Scsi {
        status: u8,
        /// Raw sense bytes, when the target supplied them
        sense: Vec<u8>,
    },

    /// Feature intentionally left out
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    /// Suspending operation aborted before completion
    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for vdisk operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a format error
    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    /// Create a truncated-image error
    pub fn truncated(msg: impl Into<String>) -> Self {
        Error::Truncated(msg.into())
    }

    /// Create an unaligned-access error
    pub fn unaligned(msg: impl Into<String>) -> Self {
        Error::Unaligned(msg.into())
    }

    /// Create an out-of-range error
    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Error::OutOfRange(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth(msg.into())
    }
}
