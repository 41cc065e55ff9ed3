//! Cluster-aware client core for a partitioned remote cache.
//!
//! This crate provides the parts of a remote cache client that have to cope
//! with several servers failing independently:
//! - **Iteration**: scans fanned out per segment owner, retargeted when a
//!   server fails, with per-segment duplicate suppression
//! - **Listeners**: server-pushed events routed per listener id, moved to
//!   another server on failure, with a fixed-period reconnect loop
//!
//! Wire encoding and connection pooling sit behind the
//! [`IterationTransport`] and [`ListenerTransport`] traits.
//!
//! # Example
//!
//! ```rust,ignore
//! use crema_client::{ClientConfig, RemoteClient, ScanRequest, LoggingListener, ListenerOptions};
//! use std::sync::Arc;
//!
//! let client = RemoteClient::new(ClientConfig::default(), transport.clone(), transport, ownership)?;
//!
//! // Iterate every entry, at least once across server failures
//! let mut entries = client.scan(ScanRequest::new("users", 1000))?;
//! while let Some(entry) = entries.next().await {
//!     let entry = entry?;
//!     println!("{:?} = {:?}", entry.key, entry.value);
//! }
//!
//! // Receive cache events
//! let id = client
//!     .add_listener("users", Arc::new(LoggingListener), ListenerOptions::default())
//!     .await?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                RemoteClient                  │
//! │  • scan(request) -> EntryStream              │
//! │  • add_listener / remove_listener            │
//! │  • handle_server_event(event)                │
//! └─────────────────────────────────────────────┘
//!          │                          │
//!          ▼                          ▼
//! ┌──────────────────┐      ┌───────────────────┐
//! │ IterationCoord.  │      │ ListenerRegistry  │
//! │ workers, tracker │      │ dispatchers,      │
//! │                  │      │ reconnect loop    │
//! └──────────────────┘      └───────────────────┘
//!          │        ┌──────────────┐     │
//!          └───────►│OwnershipView │     │
//!                   └──────────────┘     │
//!          ▼                             ▼
//! ┌─────────────────────────────────────────────┐
//! │   IterationTransport / ListenerTransport     │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Delivery guarantees
//!
//! - **Scans**: every entry of every requested segment is delivered at
//!   least once; keys resent after a retarget are suppressed while their
//!   segment is still in progress
//! - **Listeners**: after a server failure the application is told through
//!   `on_failover` and events resume once the listener is registered again

pub mod client;
pub mod config;
pub mod error;
pub mod iteration;
pub mod listener;
pub mod metrics;
pub mod partitioning;
pub mod testing;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use client::{RemoteClient, ServerEvent};
pub use config::{ClientConfig, IterationConfig, ListenerConfig};
pub use error::{Error, Result, TransportError};
pub use types::{Address, Entry, EntryMetadata, IterationId, ListenerId, SegmentId, SegmentSet, TopologyId};

// Re-export iteration types
pub use iteration::{EntryStream, IterationCoordinator, KeyTracker, ScanRequest, TrackerKind};

// Re-export listener types
pub use listener::{
    ChannelListener, ClientEvent, ClientListener, EventDispatcher, FailoverOutcome,
    ListenerNotification, ListenerOptions, ListenerRegistry, LoggingListener,
};

// Re-export partitioning types
pub use partitioning::{OwnershipSnapshot, OwnershipTable, OwnershipView};

// Re-export transport types
pub use transport::{FilterSpec, IterationTransport, ListenerTransport, Target};

// Re-export metrics types
pub use metrics::{ClientMetrics, Counter, Gauge, MetricsSnapshot};

// Re-export testing types
pub use testing::SimulatedCluster;
