//! Cluster-wide entry iteration.
//!
//! A scan is fanned out to one worker per server owning pending segments.
//! Workers pull batches strictly one request at a time, pass every entry
//! through a shared [`KeyTracker`], and report completed segments back to
//! the coordinator. When a server fails, its segments stay pending and the
//! next pass sends them to whichever node owns them now.
//!
//! ```text
//!  scan() ──► coordinator pass ──┬─► worker(10.0.0.1, {0,1}) ──┐
//!               ▲                └─► worker(10.0.0.2, {2,3}) ──┤
//!               │                                             ▼
//!               └── pending segments left? ◄── KeyTracker ──► EntryStream
//! ```
//!
//! Delivery is at-least-once across failures: the tracker suppresses keys
//! already delivered from segments that are still being retried.

mod coordinator;
mod key_tracker;
mod stream;
mod worker;

pub use coordinator::IterationCoordinator;
pub use key_tracker::{KeyTracker, ReplicatedKeyTracker, SegmentKeyTracker, TrackerKind};
pub use stream::EntryStream;

use crate::transport::FilterSpec;
use crate::types::SegmentSet;

/// Parameters of one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    /// Cache to iterate.
    pub cache_name: String,
    /// Optional server-side filter.
    pub filter: Option<FilterSpec>,
    /// Segments to iterate; `None` means all of them.
    pub segments: Option<SegmentSet>,
    /// Entries requested per round trip across all targets.
    pub batch_size: usize,
    /// Whether entries carry metadata.
    pub with_metadata: bool,
}

impl ScanRequest {
    /// Scan every entry of a cache.
    pub fn new(cache_name: impl Into<String>, batch_size: usize) -> Self {
        Self {
            cache_name: cache_name.into(),
            filter: None,
            segments: None,
            batch_size,
            with_metadata: false,
        }
    }

    /// Apply a server-side filter.
    pub fn with_filter(mut self, filter: FilterSpec) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Restrict the scan to some segments.
    pub fn with_segments(mut self, segments: SegmentSet) -> Self {
        self.segments = Some(segments);
        self
    }

    /// Request entry metadata.
    pub fn with_metadata(mut self, enabled: bool) -> Self {
        self.with_metadata = enabled;
        self
    }
}

/// Batch size each of `targets` concurrent workers requests, so that the
/// total buffered per round trip stays close to the requested size.
pub(crate) fn per_target_batch_size(requested: usize, targets: usize) -> usize {
    requested / targets.max(1) + 1
}
