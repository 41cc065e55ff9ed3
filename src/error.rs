//! Error types for the cache client.

use crate::types::{Address, ListenerId, SegmentId};
use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the cache client.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Transport-level failures reported by the wire layer.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A key was tracked for a segment whose iteration already finished.
    ///
    /// This indicates a late batch racing with segment completion and is
    /// never retried.
    #[error("segment {segment} was already finished, cannot track key")]
    SegmentAlreadyFinished { segment: SegmentId },

    /// A requested segment does not exist in the current topology.
    #[error("invalid segment {segment}: topology has {num_segments} segments")]
    InvalidSegment {
        segment: SegmentId,
        num_segments: u32,
    },

    /// An event arrived for a listener id that has no dispatcher.
    #[error("no listener registered with id {0}")]
    ListenerNotFound(ListenerId),

    /// The reconnect scheduler refused new work because it is shutting down.
    #[error("listener reconnect scheduler is shut down")]
    SchedulerShutdown,

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this failure is confined to one node and can be recovered by
    /// retargeting the work to another owner.
    pub fn is_target_local(&self) -> bool {
        match self {
            Error::Transport(e) => e.is_target_local(),
            _ => false,
        }
    }

    /// Whether an operation that failed with this error may succeed if tried
    /// again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(e) => e.is_target_local() || e.is_no_servers(),
            _ => false,
        }
    }

    /// The node the failure is attributed to, if known.
    pub fn failed_address(&self) -> Option<Address> {
        match self {
            Error::Transport(e) => e.address(),
            _ => None,
        }
    }
}

/// Errors raised by the remote transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection to a node failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: Address, reason: String },

    /// Connection to a node was closed while a request was outstanding.
    #[error("connection to {addr} closed")]
    ConnectionClosed { addr: Address },

    /// The node is stopping and rejected the request.
    #[error("node {addr} is shutting down")]
    NodeShuttingDown { addr: Address },

    /// The server no longer knows the iteration session, typically after a
    /// restart.
    #[error("iteration session is invalid on {addr}")]
    InvalidSession { addr: Address },

    /// Every candidate node has been excluded or is unreachable.
    #[error("no servers available")]
    NoServersAvailable,

    /// The server processed the request and reported an error.
    #[error("server error: {0}")]
    Server(String),
}

impl TransportError {
    /// Transport and lifecycle failures of a single node.
    pub fn is_target_local(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed { .. }
                | TransportError::ConnectionClosed { .. }
                | TransportError::NodeShuttingDown { .. }
                | TransportError::InvalidSession { .. }
        )
    }

    fn is_no_servers(&self) -> bool {
        matches!(self, TransportError::NoServersAvailable)
    }

    /// The node this error refers to, if any.
    pub fn address(&self) -> Option<Address> {
        match self {
            TransportError::ConnectionFailed { addr, .. }
            | TransportError::ConnectionClosed { addr }
            | TransportError::NodeShuttingDown { addr }
            | TransportError::InvalidSession { addr } => Some(*addr),
            TransportError::NoServersAvailable | TransportError::Server(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> Address {
        "127.0.0.1:11222".parse().unwrap()
    }

    #[test]
    fn test_target_local_classification() {
        let closed = Error::from(TransportError::ConnectionClosed { addr: addr() });
        assert!(closed.is_target_local());
        assert!(closed.is_retryable());
        assert_eq!(closed.failed_address(), Some(addr()));

        let server = Error::from(TransportError::Server("boom".into()));
        assert!(!server.is_target_local());
        assert!(!server.is_retryable());
        assert_eq!(server.failed_address(), None);
    }

    #[test]
    fn test_client_state_errors_are_not_retryable() {
        assert!(!Error::SegmentAlreadyFinished { segment: 3 }.is_retryable());
        assert!(!Error::SchedulerShutdown.is_retryable());
        assert!(!Error::ListenerNotFound(ListenerId::from_static(b"l1")).is_target_local());
    }

    #[test]
    fn test_no_servers_is_retryable_but_not_local() {
        let err = Error::from(TransportError::NoServersAvailable);
        assert!(err.is_retryable());
        assert!(!err.is_target_local());
    }
}
