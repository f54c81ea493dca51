//! DHT error types.

use thiserror::Error;

/// Errors surfaced by the DHT client.
#[derive(Debug, Error)]
pub enum DhtError {
    /// Datagram was not valid bencode.
    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    /// Bencode was valid but the message structure was not.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Query named a method this node does not implement.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// The remote answered with a KRPC error message.
    #[error("remote error {code}: {message}")]
    Remote {
        /// Numeric KRPC error code.
        code: i64,
        /// Description sent by the remote.
        message: String,
    },

    /// No response arrived within the query timeout.
    #[error("query timed out")]
    Timeout,

    /// None of the configured bootstrap nodes answered.
    #[error("no bootstrap node reachable")]
    BootstrapFailed,

    /// Sending on the shared socket failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = DhtError::Remote {
            code: 203,
            message: "bad token".into(),
        };
        assert_eq!(err.to_string(), "remote error 203: bad token");
        assert_eq!(DhtError::Timeout.to_string(), "query timed out");
    }
}
