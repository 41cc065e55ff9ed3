//! The consumer side of a scan.

use super::key_tracker::KeyTracker;
use crate::error::Result;
use crate::types::{Entry, SegmentSet, TopologyId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Lazy, forward-only sequence of the entries produced by a scan.
///
/// The stream cannot be restarted: once it returns `None` or an error it
/// stays exhausted. Dropping it cancels the scan.
///
/// ```rust,ignore
/// let mut entries = client.scan(ScanRequest::new("users", 1000))?;
/// while let Some(entry) = entries.next().await {
///     let entry = entry?;
///     println!("{:?}", entry.key);
/// }
/// ```
pub struct EntryStream {
    receiver: mpsc::Receiver<Result<Entry>>,
    token: CancellationToken,
    tracker: Arc<KeyTracker>,
    topology_id: TopologyId,
    exhausted: bool,
}

impl EntryStream {
    pub(crate) fn new(
        receiver: mpsc::Receiver<Result<Entry>>,
        token: CancellationToken,
        tracker: Arc<KeyTracker>,
        topology_id: TopologyId,
    ) -> Self {
        Self {
            receiver,
            token,
            tracker,
            topology_id,
            exhausted: false,
        }
    }

    /// Wait for the next entry.
    ///
    /// Returns `None` when every segment has been delivered or the scan was
    /// cancelled, and `Some(Err(_))` once if the scan failed.
    pub async fn next(&mut self) -> Option<Result<Entry>> {
        if self.exhausted {
            return None;
        }
        match self.receiver.recv().await {
            Some(Ok(entry)) => Some(Ok(entry)),
            Some(Err(e)) => {
                self.finish();
                Some(Err(e))
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }

    /// Drain the remaining entries.
    pub async fn collect(mut self) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next().await {
            entries.push(entry?);
        }
        Ok(entries)
    }

    /// Stop the scan. Outstanding requests complete in the background and
    /// their sessions are closed; no further entries are returned.
    pub fn cancel(&mut self) {
        if !self.token.is_cancelled() {
            tracing::debug!(topology_id = self.topology_id, "Cancelling scan");
        }
        self.finish();
    }

    /// Whether the scan was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Topology the scan started with.
    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    /// Segments that have not been delivered completely yet. `None` unless
    /// the scan tracks keys per segment.
    pub fn missed_segments(&self) -> Option<SegmentSet> {
        self.tracker.missed_segments()
    }

    fn finish(&mut self) {
        self.exhausted = true;
        self.token.cancel();
        self.receiver.close();
    }
}

impl Drop for EntryStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for EntryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStream")
            .field("topology_id", &self.topology_id)
            .field("tracker", &self.tracker.kind())
            .field("exhausted", &self.exhausted)
            .finish()
    }
}
