//! Partitioning module describing how keys map to segments and segments to
//! servers.
//!
//! The ownership computation itself happens on the servers; the client only
//! mirrors the layout they publish.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    OwnershipTable                            │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │          Arc<OwnershipSnapshot> (topology 7)          │  │
//! │  │   10.0.0.1 → {0, 1}     10.0.0.2 → {2, 3}            │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │                                                             │
//! │  Key "user:123" → xxhash64 % 4 → segment 2 → 10.0.0.2      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use crema_client::partitioning::{OwnershipSnapshot, OwnershipTable, OwnershipView};
//!
//! let a = "10.0.0.1:11222".parse().unwrap();
//! let b = "10.0.0.2:11222".parse().unwrap();
//! let table = OwnershipTable::new(OwnershipSnapshot::from_primaries(7, &[a, a, b, b]));
//!
//! let segment = table.segment_for(b"user:123").unwrap();
//! assert!(segment < 4);
//! assert_eq!(table.topology_id(), 7);
//! ```

mod ownership;

pub use ownership::{segment_of, OwnershipSnapshot, OwnershipTable, OwnershipView};
