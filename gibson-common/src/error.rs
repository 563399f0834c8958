//! # Error Taxonomy
//!
//! Purpose: One error type for codec, connection, and pool failures.
//!
//! ## Design Principles
//! 1. **Clone-able**: A fatal error is delivered to every pending call, so
//!    the error must be cheap to duplicate (`io::Error` is shared via `Arc`).
//! 2. **Severity Is Queryable**: `is_fatal` tells stream corruption apart
//!    from per-call failures.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type used across the Gibson crates.
pub type GibsonResult<T> = Result<T, GibsonError>;

/// Errors surfaced by the Gibson client.
#[derive(Debug, Clone, Error)]
pub enum GibsonError {
    // -------------------------------------------------------------------------
    // Stream errors (connection-fatal)
    // -------------------------------------------------------------------------
    /// Stream corruption: unknown reply code, unknown encoding, malformed payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport failure while reading or writing.
    #[error("io error: {0}")]
    Io(Arc<io::Error>),

    // -------------------------------------------------------------------------
    // Server reply errors (per-call)
    // -------------------------------------------------------------------------
    /// Generic server error (REPL_ERR).
    #[error("server error")]
    Server,

    /// The server expected a numeric argument.
    #[error("expected a number")]
    ExpectedNumber,

    /// The server reached its memory limit.
    #[error("memory limit reached")]
    MemoryLimit,

    /// The key is locked.
    #[error("key is locked")]
    KeyLocked,

    // -------------------------------------------------------------------------
    // Local errors (nothing reached the socket)
    // -------------------------------------------------------------------------
    /// Argument could not be encoded.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Command token is not in the op-code table.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Reply bytes could not be decoded with the requested charset.
    #[error("decode error: {0}")]
    Decode(String),

    /// Reply variant did not match what the command returns.
    #[error("unexpected reply")]
    UnexpectedReply,

    // -------------------------------------------------------------------------
    // Lifecycle errors
    // -------------------------------------------------------------------------
    /// The call was cancelled by a clean connection close.
    #[error("call cancelled")]
    Cancelled,

    /// The connection is closed or closing.
    #[error("connection closed")]
    ConnectionClosed,

    /// No pooled connection became available in time.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// Configuration could not be parsed or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
}

impl GibsonError {
    /// Returns true when the error tears down the owning connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GibsonError::Protocol(_) | GibsonError::Io(_))
    }

    /// Builds a protocol error from any displayable reason.
    pub fn protocol(reason: impl Into<String>) -> Self {
        GibsonError::Protocol(reason.into())
    }
}

impl From<io::Error> for GibsonError {
    fn from(err: io::Error) -> Self {
        GibsonError::Io(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(GibsonError::protocol("bad code").is_fatal());
        assert!(GibsonError::from(io::Error::from(io::ErrorKind::BrokenPipe)).is_fatal());
        assert!(!GibsonError::KeyLocked.is_fatal());
        assert!(!GibsonError::Cancelled.is_fatal());
    }

    #[test]
    fn test_display() {
        assert_eq!(GibsonError::protocol("x").to_string(), "protocol error: x");
        assert_eq!(GibsonError::UnknownCommand("zadd".into()).to_string(), "unknown command: zadd");
    }
}
