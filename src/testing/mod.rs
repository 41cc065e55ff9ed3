//! Testing utilities for the cache client.
//!
//! [`SimulatedCluster`] implements both transport traits in memory so scans
//! and listeners can be exercised against node crashes, registration
//! failures and topology changes without a network.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     SimulatedCluster                          │
//! │  nodes: addr -> { alive, segments, fail_after_batches }       │
//! │  data:  key -> value (segment = xxhash64(key) % n)            │
//! │                                                                │
//! │  IterationTransport          ListenerTransport                 │
//! │  - start / next / end        - register (fail N / forever)     │
//! │  - crash after N batches     - unregister / release            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let cluster = Arc::new(SimulatedCluster::with_nodes(4, 2));
//! cluster.populate(100);
//! cluster.fail_node_after(node_addr(1), 1);
//!
//! let client = RemoteClient::new(
//!     ClientConfig::default(),
//!     cluster.clone(),
//!     cluster.clone(),
//!     Arc::new(cluster.ownership()),
//! )?;
//! let entries = client.scan(client.scan_request("c"))?.collect().await?;
//! assert_eq!(entries.len(), 100);
//! ```

mod cluster;
mod utils;

mod listener_tests;

pub use cluster::{node_addr, SimulatedCluster, PREFIX_FILTER};
pub use utils::{key_in_segment, wait_for, wait_for_result};

#[cfg(test)]
pub use utils::init_tracing;
