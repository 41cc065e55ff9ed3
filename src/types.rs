//! Core types used throughout the cache client.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;

/// Address of a cache server.
pub type Address = SocketAddr;

/// Identifier of a keyspace segment, in `[0, num_segments)`.
pub type SegmentId = u32;

/// An ordered set of segments.
pub type SegmentSet = BTreeSet<SegmentId>;

/// Monotonically increasing version of the cluster ownership layout.
pub type TopologyId = i64;

/// Topology id reported when the client has not received any topology.
pub const UNKNOWN_TOPOLOGY: TopologyId = -1;

/// Build a segment set covering `[0, num_segments)`.
pub fn all_segments(num_segments: u32) -> SegmentSet {
    (0..num_segments).collect()
}

/// A cache entry returned by an iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Raw key bytes as stored on the server.
    pub key: Bytes,
    /// Raw value bytes.
    pub value: Bytes,
    /// Entry metadata, present only when the scan requested it.
    pub metadata: Option<EntryMetadata>,
}

impl Entry {
    /// Create an entry without metadata.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            metadata: None,
        }
    }

    /// Attach metadata to the entry.
    pub fn with_metadata(mut self, metadata: EntryMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Expiration and versioning metadata of an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Server-assigned entry version.
    pub version: u64,
    /// Creation timestamp in milliseconds, if the entry is mortal.
    pub created: Option<i64>,
    /// Lifespan in seconds, `None` for immortal entries.
    pub lifespan: Option<u32>,
    /// Last access timestamp in milliseconds.
    pub last_used: Option<i64>,
    /// Maximum idle time in seconds.
    pub max_idle: Option<u32>,
}

/// Opaque identifier of a registered client listener.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(Bytes);

impl ListenerId {
    /// Create a new random listener id.
    pub fn generate() -> Self {
        Self(Bytes::copy_from_slice(uuid::Uuid::new_v4().as_bytes()))
    }

    /// Wrap caller-provided bytes.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Wrap static bytes.
    pub const fn from_static(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }

    /// The raw id bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerId(")?;
        write_hex(f, &self.0)?;
        write!(f, ")")
    }
}

/// Opaque server-assigned handle of one in-progress iteration.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IterationId(Bytes);

impl IterationId {
    /// Wrap the bytes returned by the server.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The raw id bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for IterationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for IterationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IterationId(")?;
        write_hex(f, &self.0)?;
        write!(f, ")")
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{:02x}", b)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_segments() {
        let segments = all_segments(4);
        assert_eq!(segments.into_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(all_segments(0).is_empty());
    }

    #[test]
    fn test_listener_id_display() {
        let id = ListenerId::from_static(&[0x01, 0xab]);
        assert_eq!(id.to_string(), "01ab");
        assert_eq!(format!("{:?}", id), "ListenerId(01ab)");
    }

    #[test]
    fn test_generated_listener_ids_are_unique() {
        let a = ListenerId::generate();
        let b = ListenerId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_bytes().len(), 16);
    }

    #[test]
    fn test_entry_builder() {
        let entry = Entry::new(&b"k"[..], &b"v"[..]).with_metadata(EntryMetadata {
            version: 7,
            ..Default::default()
        });
        assert_eq!(entry.key, Bytes::from_static(b"k"));
        assert_eq!(entry.metadata.unwrap().version, 7);
    }
}
