//! NAT traversal error types.

use thiserror::Error;

/// Errors from the STUN probe path.
///
/// Everything except [`StunError::Io`] and [`StunError::Timeout`]
/// describes a single discarded datagram, not a failed probe.
#[derive(Debug, Error)]
pub enum StunError {
    /// Socket I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// No valid response before the deadline.
    #[error("stun probe timed out")]
    Timeout,

    /// Datagram shorter than the fixed header.
    #[error("datagram shorter than stun header")]
    Truncated,

    /// Magic cookie did not match.
    #[error("bad magic cookie")]
    BadMagicCookie,

    /// Transaction id did not match the outstanding request.
    #[error("transaction id mismatch")]
    TransactionMismatch,

    /// Message type was not a binding success response.
    #[error("not a binding success response: {0:#06x}")]
    NotASuccessResponse(u16),

    /// Response carried neither mapping attribute.
    #[error("response carried no usable mapped address")]
    NoMappedAddress,
}
