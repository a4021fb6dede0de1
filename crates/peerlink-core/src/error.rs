//! Error types
//!
//! One error enum for the whole crate. Configuration problems fail fast at
//! construction, store and transport failures carry their source, and lookup
//! misses are typed so callers can tell "absent" apart from "broken".

use thiserror::Error;

/// Errors produced by discovery, registration and the connection pool.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid configuration (never retried)
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Failure reported by the etcd client
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    /// Failure reported by a non-etcd coordination store
    #[error("coordination store error: {0}")]
    Store(String),

    /// gRPC transport failure
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// A connection to a peer could not be established
    #[error("dial to {address} failed: {reason}")]
    Dial { address: String, reason: String },

    /// The requested peer is not known or has no live connection
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// The known-peer set is empty
    #[error("no known peers")]
    NoPeers,

    /// A watch or keep-alive stream ended unexpectedly
    #[error("watch stream closed")]
    WatchClosed,
}

impl Error {
    /// Shorthand for building a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Whether this is a lookup miss rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::PeerNotFound(_) | Error::NoPeers)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(Error::PeerNotFound("node-1".into()).is_not_found());
        assert!(Error::NoPeers.is_not_found());
        assert!(!Error::config("namespace must be set").is_not_found());
        assert!(!Error::WatchClosed.is_not_found());
    }

    #[test]
    fn test_display() {
        let err = Error::Dial {
            address: "10.0.0.1:9000".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "dial to 10.0.0.1:9000 failed: connection refused"
        );
    }
}
