//! Segment ownership views.
//!
//! The client learns the server-side segment layout from topology updates
//! pushed by the cluster. This module keeps the latest layout and answers
//! the two questions iteration needs: which segment a key lives in, and
//! which node owns each segment.

use crate::types::{Address, SegmentId, SegmentSet, TopologyId, UNKNOWN_TOPOLOGY};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;
use twox_hash::XxHash64;

/// Read-only view of the cluster's segment ownership.
pub trait OwnershipView: Send + Sync + 'static {
    /// Segment the key hashes to, or `None` when the cache is not
    /// partitioned into segments.
    fn segment_for(&self, key: &[u8]) -> Option<SegmentId>;

    /// Segments owned by each node in the current topology.
    fn owners(&self) -> HashMap<Address, SegmentSet>;

    /// Version of the current topology, [`UNKNOWN_TOPOLOGY`] if none was
    /// received yet.
    fn topology_id(&self) -> TopologyId;

    /// Total number of segments, `None` for unpartitioned caches.
    fn num_segments(&self) -> Option<u32>;

    /// Whether the view carries per-segment ownership information.
    fn has_segments(&self) -> bool {
        self.num_segments().is_some()
    }
}

/// Immutable snapshot of segment ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipSnapshot {
    topology_id: TopologyId,
    num_segments: Option<u32>,
    owners: HashMap<Address, SegmentSet>,
}

impl OwnershipSnapshot {
    /// Create a segmented snapshot.
    pub fn new(
        topology_id: TopologyId,
        num_segments: u32,
        owners: HashMap<Address, SegmentSet>,
    ) -> Self {
        Self {
            topology_id,
            num_segments: Some(num_segments),
            owners,
        }
    }

    /// Create a snapshot for a cache without segment ownership, such as a
    /// replicated or local cache. Servers are listed with no segments.
    pub fn unpartitioned(topology_id: TopologyId, servers: impl IntoIterator<Item = Address>) -> Self {
        Self {
            topology_id,
            num_segments: None,
            owners: servers.into_iter().map(|a| (a, SegmentSet::new())).collect(),
        }
    }

    /// Snapshot used before any topology has been received.
    pub fn unknown() -> Self {
        Self {
            topology_id: UNKNOWN_TOPOLOGY,
            num_segments: None,
            owners: HashMap::new(),
        }
    }

    /// Build a segmented snapshot from a primary owner per segment.
    ///
    /// `primaries[s]` is the owner of segment `s`.
    pub fn from_primaries(topology_id: TopologyId, primaries: &[Address]) -> Self {
        let mut owners: HashMap<Address, SegmentSet> = HashMap::new();
        for (segment, addr) in primaries.iter().enumerate() {
            owners.entry(*addr).or_default().insert(segment as SegmentId);
        }
        Self::new(topology_id, primaries.len() as u32, owners)
    }

    /// The topology id.
    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    /// Number of segments, if partitioned.
    pub fn num_segments(&self) -> Option<u32> {
        self.num_segments
    }

    /// Segments owned by each server.
    pub fn owners(&self) -> &HashMap<Address, SegmentSet> {
        &self.owners
    }

    /// Primary owner of a segment.
    pub fn owner_of(&self, segment: SegmentId) -> Option<Address> {
        self.owners
            .iter()
            .find(|(_, segments)| segments.contains(&segment))
            .map(|(addr, _)| *addr)
    }

    /// All known servers.
    pub fn servers(&self) -> Vec<Address> {
        let mut servers: Vec<_> = self.owners.keys().copied().collect();
        servers.sort();
        servers
    }
}

/// Segment of a key for a cache with `num_segments` segments.
pub fn segment_of(key: &[u8], num_segments: u32) -> SegmentId {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key);
    (hasher.finish() % u64::from(num_segments.max(1))) as SegmentId
}

/// Ownership view backed by the most recent topology update.
///
/// Readers always see a complete snapshot; updates swap the whole snapshot
/// and never mutate one in place.
#[derive(Debug)]
pub struct OwnershipTable {
    current: RwLock<Arc<OwnershipSnapshot>>,
}

impl OwnershipTable {
    /// Create a table holding the given snapshot.
    pub fn new(snapshot: OwnershipSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Create a table for a cache without segment ownership.
    pub fn unpartitioned(topology_id: TopologyId, servers: impl IntoIterator<Item = Address>) -> Self {
        Self::new(OwnershipSnapshot::unpartitioned(topology_id, servers))
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<OwnershipSnapshot> {
        self.current.read().clone()
    }

    /// Install a newer snapshot.
    ///
    /// Returns `false` and keeps the current snapshot if the update is not
    /// newer than what is already installed.
    pub fn update(&self, snapshot: OwnershipSnapshot) -> bool {
        let mut current = self.current.write();
        if current.topology_id != UNKNOWN_TOPOLOGY && snapshot.topology_id <= current.topology_id {
            tracing::debug!(
                current = current.topology_id,
                received = snapshot.topology_id,
                "Ignoring stale topology update"
            );
            return false;
        }
        tracing::debug!(
            topology_id = snapshot.topology_id,
            servers = snapshot.owners.len(),
            "Installed topology"
        );
        *current = Arc::new(snapshot);
        true
    }
}

impl Default for OwnershipTable {
    fn default() -> Self {
        Self::new(OwnershipSnapshot::unknown())
    }
}

impl OwnershipView for OwnershipTable {
    fn segment_for(&self, key: &[u8]) -> Option<SegmentId> {
        self.current
            .read()
            .num_segments
            .map(|n| segment_of(key, n))
    }

    fn owners(&self) -> HashMap<Address, SegmentSet> {
        self.current.read().owners.clone()
    }

    fn topology_id(&self) -> TopologyId {
        self.current.read().topology_id
    }

    fn num_segments(&self) -> Option<u32> {
        self.current.read().num_segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_from_primaries() {
        let snapshot = OwnershipSnapshot::from_primaries(3, &[addr(1), addr(1), addr(2), addr(2)]);
        assert_eq!(snapshot.num_segments(), Some(4));
        assert_eq!(snapshot.owners()[&addr(1)], SegmentSet::from([0, 1]));
        assert_eq!(snapshot.owners()[&addr(2)], SegmentSet::from([2, 3]));
        assert_eq!(snapshot.owner_of(3), Some(addr(2)));
        assert_eq!(snapshot.owner_of(9), None);
    }

    #[test]
    fn test_segment_of_is_stable_and_bounded() {
        for key in [&b"a"[..], b"user:1", b"user:2", b""] {
            let s = segment_of(key, 16);
            assert!(s < 16);
            assert_eq!(s, segment_of(key, 16));
        }
    }

    #[test]
    fn test_table_rejects_stale_updates() {
        let table = OwnershipTable::default();
        assert_eq!(table.topology_id(), UNKNOWN_TOPOLOGY);
        assert!(!table.has_segments());

        assert!(table.update(OwnershipSnapshot::from_primaries(5, &[addr(1)])));
        assert!(!table.update(OwnershipSnapshot::from_primaries(4, &[addr(2)])));
        assert_eq!(table.topology_id(), 5);
        assert_eq!(table.snapshot().servers(), vec![addr(1)]);
    }

    #[test]
    fn test_unpartitioned_view() {
        let table = OwnershipTable::unpartitioned(1, [addr(1), addr(2)]);
        assert_eq!(table.segment_for(b"k"), None);
        assert_eq!(table.num_segments(), None);
        assert_eq!(table.owners().len(), 2);
    }
}
