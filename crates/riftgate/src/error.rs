//! Error types for the relay coordination protocol.
//!
//! Only local failures surface as `Err`: codec violations and request
//! preconditions. Protocol-level outcomes (busy servers, missing recipients,
//! wrong passwords) are delivered asynchronously through the result-handler
//! traits and are never errors here.

use std::net::SocketAddr;
use thiserror::Error;

/// Wire codec errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// Message too short to parse
    #[error("message too short: expected at least {expected} more bytes, got {actual}")]
    TooShort {
        /// Bytes required by the next field
        expected: usize,
        /// Bytes actually remaining
        actual: usize,
    },

    /// Unknown message-ID byte
    #[error("unknown message id: 0x{0:02X}")]
    UnknownMessageId(u8),

    /// Unknown address family tag (only 4 and 6 are valid)
    #[error("unknown address family tag: {0}")]
    UnknownAddressFamily(u8),

    /// Unknown forwarding outcome code
    #[error("unknown forwarding outcome code: {0}")]
    UnknownOutcome(u8),

    /// Length-prefixed string was not valid UTF-8
    #[error("string field is not valid UTF-8")]
    InvalidString,

    /// A variable-length field exceeds its 16-bit length prefix
    #[error("field too long for its length prefix: {0} bytes")]
    FieldTooLong(usize),
}

/// Synchronous precondition failures when issuing a forwarding request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    /// Not connected to the addressed coordinator
    #[error("not connected to coordinator {0}")]
    NotConnected(SocketAddr),

    /// No result handler set; a terminal outcome would have nowhere to go
    #[error("no result handler set")]
    NoHandlerSet,
}
