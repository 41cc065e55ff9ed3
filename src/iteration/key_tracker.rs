//! Deduplication of entries redelivered during an iteration.
//!
//! When a target fails mid-iteration its pending segments are retried on
//! another server, which resends every entry of those segments. The tracker
//! remembers which keys were already handed to the consumer so each one is
//! delivered once per scan.

use crate::error::{Error, Result};
use crate::partitioning::OwnershipView;
use crate::types::{all_segments, SegmentId, SegmentSet, UNKNOWN_TOPOLOGY};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Which tracking strategy a scan uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerKind {
    /// No topology: every entry is accepted.
    NoOp,
    /// No segment ownership: one flat set of seen keys.
    Replicated,
    /// Per-segment sets, released as segments complete.
    Segmented,
}

impl TrackerKind {
    /// Pick a strategy from what the client knows about the topology.
    pub fn select(has_topology: bool, has_ownership: bool) -> Self {
        if !has_topology {
            TrackerKind::NoOp
        } else if !has_ownership {
            TrackerKind::Replicated
        } else {
            TrackerKind::Segmented
        }
    }
}

/// Scan-scoped key deduplication state.
#[derive(Debug)]
pub enum KeyTracker {
    NoOp,
    Replicated(ReplicatedKeyTracker),
    Segmented(SegmentKeyTracker),
}

impl KeyTracker {
    /// Create the tracker for a scan over `segments` (all segments when
    /// `None`) given the current ownership view.
    pub fn create(view: Arc<dyn OwnershipView>, segments: Option<&SegmentSet>) -> Self {
        let has_topology = view.topology_id() != UNKNOWN_TOPOLOGY;
        match (TrackerKind::select(has_topology, view.has_segments()), view.num_segments()) {
            (TrackerKind::Segmented, Some(num_segments)) => {
                let segments = segments
                    .cloned()
                    .unwrap_or_else(|| all_segments(num_segments));
                KeyTracker::Segmented(SegmentKeyTracker::new(view, num_segments, &segments))
            }
            (TrackerKind::NoOp, _) => KeyTracker::NoOp,
            _ => KeyTracker::Replicated(ReplicatedKeyTracker::default()),
        }
    }

    /// The strategy in use.
    pub fn kind(&self) -> TrackerKind {
        match self {
            KeyTracker::NoOp => TrackerKind::NoOp,
            KeyTracker::Replicated(_) => TrackerKind::Replicated,
            KeyTracker::Segmented(_) => TrackerKind::Segmented,
        }
    }

    /// Record a key. Returns `true` the first time the key is seen and
    /// `false` for a repeat.
    pub fn track(&self, key: &Bytes) -> Result<bool> {
        match self {
            KeyTracker::NoOp => Ok(true),
            KeyTracker::Replicated(tracker) => Ok(tracker.track(key)),
            KeyTracker::Segmented(tracker) => tracker.track(key),
        }
    }

    /// Release the state of completed segments.
    pub fn segments_finished(&self, finished: &SegmentSet) {
        if let KeyTracker::Segmented(tracker) = self {
            tracker.segments_finished(finished);
        }
    }

    /// Segments that were requested but never finished. Only the segmented
    /// tracker knows this.
    pub fn missed_segments(&self) -> Option<SegmentSet> {
        match self {
            KeyTracker::Segmented(tracker) => Some(tracker.missed_segments()),
            _ => None,
        }
    }
}

/// Flat set of every key seen by the scan.
#[derive(Debug, Default)]
pub struct ReplicatedKeyTracker {
    seen: Mutex<HashSet<Bytes>>,
}

impl ReplicatedKeyTracker {
    fn track(&self, key: &Bytes) -> bool {
        self.seen.lock().insert(key.clone())
    }
}

/// Seen keys per segment; a slot is `None` once its segment finished.
pub struct SegmentKeyTracker {
    view: Arc<dyn OwnershipView>,
    slots: Vec<Mutex<Option<HashSet<Bytes>>>>,
}

impl SegmentKeyTracker {
    fn new(view: Arc<dyn OwnershipView>, num_segments: u32, segments: &SegmentSet) -> Self {
        let slots = (0..num_segments)
            .map(|s| Mutex::new(segments.contains(&s).then(HashSet::new)))
            .collect();
        Self { view, slots }
    }

    fn track(&self, key: &Bytes) -> Result<bool> {
        let segment = self.view.segment_for(key).ok_or_else(|| {
            Error::Internal("ownership view lost segment information during a segmented scan".into())
        })?;
        let slot = self.slots.get(segment as usize).ok_or_else(|| {
            Error::Internal(format!(
                "key maps to segment {} outside the {} tracked segments",
                segment,
                self.slots.len()
            ))
        })?;

        match slot.lock().as_mut() {
            Some(seen) => Ok(seen.insert(key.clone())),
            None => {
                tracing::error!(segment, "Received key for a segment that already finished");
                Err(Error::SegmentAlreadyFinished { segment })
            }
        }
    }

    fn segments_finished(&self, finished: &SegmentSet) {
        for &segment in finished {
            if let Some(slot) = self.slots.get(segment as usize) {
                slot.lock().take();
            }
        }
        tracing::trace!(segments = ?finished, "Released key tracking for finished segments");
    }

    fn missed_segments(&self) -> SegmentSet {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.lock().is_some())
            .map(|(segment, _)| segment as SegmentId)
            .collect()
    }
}

impl std::fmt::Debug for SegmentKeyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentKeyTracker")
            .field("num_segments", &self.slots.len())
            .field("active", &self.missed_segments().len())
            .finish()
    }
}
