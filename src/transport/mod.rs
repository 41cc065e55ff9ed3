//! Remote operations consumed by iteration and listener handling.
//!
//! Frame encoding, channel pooling and load balancing live behind these
//! traits. Implementations must route a request to the requested target,
//! or pick any live server not in the exclusion set for [`Target::Any`],
//! and report node-local failures with a [`TransportError`] carrying the
//! node address.
//!
//! [`TransportError`]: crate::error::TransportError

use crate::error::Result;
use crate::listener::ListenerOptions;
use crate::types::{Address, Entry, IterationId, ListenerId, SegmentSet};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Where to send a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A specific server.
    Node(Address),
    /// Any live server except the excluded ones.
    Any { exclude: HashSet<Address> },
}

impl Target {
    /// Any server, no exclusions.
    pub fn any() -> Self {
        Target::Any {
            exclude: HashSet::new(),
        }
    }

    /// The explicit address, if any.
    pub fn address(&self) -> Option<Address> {
        match self {
            Target::Node(addr) => Some(*addr),
            Target::Any { .. } => None,
        }
    }
}

/// Server-side filter/converter applied to iterated entries.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Name of the filter factory deployed on the server.
    pub factory: String,
    /// Marshalled factory parameters.
    pub params: Vec<Bytes>,
}

impl FilterSpec {
    /// Create a filter spec without parameters.
    pub fn new(factory: impl Into<String>) -> Self {
        Self {
            factory: factory.into(),
            params: Vec::new(),
        }
    }

    /// Add a parameter.
    pub fn with_param(mut self, param: impl Into<Bytes>) -> Self {
        self.params.push(param.into());
        self
    }
}

/// The start command sent by one iteration worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartIteration {
    /// Cache being iterated.
    pub cache_name: String,
    /// Optional server-side filter.
    pub filter: Option<FilterSpec>,
    /// Segments this target should iterate, `None` for all local data.
    pub segments: Option<SegmentSet>,
    /// Entries per batch for this target.
    pub batch_size: usize,
    /// Whether entries carry metadata.
    pub with_metadata: bool,
}

/// An iteration session opened on one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationSession {
    /// Server-assigned session id.
    pub id: IterationId,
    /// Server holding the session; all follow-up calls go there.
    pub address: Address,
}

/// One batch returned by `next_iteration`.
#[derive(Debug, Clone, Default)]
pub struct IterationBatch {
    /// Entries in this batch.
    pub entries: Vec<Entry>,
    /// Segments the server finished iterating with this batch.
    pub completed_segments: SegmentSet,
    /// Whether the server has more entries for this session.
    pub has_more: bool,
}

/// Status returned when ending an iteration session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndStatus {
    /// The session was closed.
    Success,
    /// The server did not know the session.
    InvalidIteration,
    /// Any other status code reported by the server.
    Other(u8),
}

impl EndStatus {
    /// Whether the status is a success.
    pub fn is_success(&self) -> bool {
        matches!(self, EndStatus::Success)
    }

    /// Whether the status reports an unknown session.
    pub fn is_invalid_iteration(&self) -> bool {
        matches!(self, EndStatus::InvalidIteration)
    }
}

/// Remote iteration operations.
#[async_trait]
pub trait IterationTransport: Send + Sync + 'static {
    /// Open an iteration session on the target.
    async fn start_iteration(
        &self,
        request: &StartIteration,
        target: &Target,
    ) -> Result<IterationSession>;

    /// Fetch the next batch of a session.
    async fn next_iteration(&self, session: &IterationSession) -> Result<IterationBatch>;

    /// Close a session. Servers keep sessions until told otherwise.
    async fn end_iteration(&self, session: &IterationSession) -> Result<EndStatus>;
}

/// Everything needed to (re-)register a client listener on a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerRegistration {
    /// Listener id, stable across failovers.
    pub listener_id: ListenerId,
    /// Cache the listener is attached to.
    pub cache_name: String,
    /// Server-side filtering options.
    pub options: ListenerOptions,
}

/// Remote listener operations.
#[async_trait]
pub trait ListenerTransport: Send + Sync + 'static {
    /// Register a listener on the target and return the server it is bound
    /// to. Push events for the listener arrive from that server afterwards.
    async fn register_listener(
        &self,
        registration: &ListenerRegistration,
        target: &Target,
    ) -> Result<Address>;

    /// Remove a listener registration from a server.
    async fn unregister_listener(&self, listener_id: &ListenerId, addr: Address) -> Result<()>;

    /// Stop routing push events for the listener on the channel to `addr`.
    fn release_listener(&self, addr: Address, listener_id: &ListenerId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_address() {
        let addr: Address = "127.0.0.1:11222".parse().unwrap();
        assert_eq!(Target::Node(addr).address(), Some(addr));
        assert_eq!(Target::any().address(), None);
    }

    #[test]
    fn test_end_status_predicates() {
        assert!(EndStatus::Success.is_success());
        assert!(EndStatus::InvalidIteration.is_invalid_iteration());
        assert!(!EndStatus::Other(0x85).is_success());
    }

    #[test]
    fn test_filter_spec_builder() {
        let filter = FilterSpec::new("by-prefix").with_param(&b"user:"[..]);
        assert_eq!(filter.factory, "by-prefix");
        assert_eq!(filter.params.len(), 1);
    }
}
