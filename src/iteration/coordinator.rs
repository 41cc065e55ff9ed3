//! Scan coordination across the servers owning the requested segments.

use super::key_tracker::KeyTracker;
use super::stream::EntryStream;
use super::worker::{IterationWorker, WorkerOutcome};
use super::{per_target_batch_size, ScanRequest};
use crate::error::{Error, Result};
use crate::metrics::ClientMetrics;
use crate::partitioning::OwnershipView;
use crate::transport::{IterationTransport, Target};
use crate::types::{all_segments, Address, Entry, SegmentSet};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Starts scans and owns the collaborators they share.
pub struct IterationCoordinator {
    transport: Arc<dyn IterationTransport>,
    ownership: Arc<dyn OwnershipView>,
    metrics: Arc<ClientMetrics>,
    next_scan_id: AtomicU64,
}

impl IterationCoordinator {
    /// Create a coordinator.
    pub fn new(
        transport: Arc<dyn IterationTransport>,
        ownership: Arc<dyn OwnershipView>,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        Self {
            transport,
            ownership,
            metrics,
            next_scan_id: AtomicU64::new(1),
        }
    }

    /// Start a scan and return the lazy entry sequence.
    ///
    /// Must be called from within a Tokio runtime; the scan runs on a
    /// background task and stops when the stream is cancelled or dropped.
    pub fn scan(&self, request: ScanRequest) -> Result<EntryStream> {
        if request.batch_size == 0 {
            return Err(Error::Config("scan batch size must be positive".into()));
        }

        let num_segments = self.ownership.num_segments();
        if let (Some(requested), Some(n)) = (&request.segments, num_segments) {
            if let Some(&segment) = requested.iter().find(|&&s| s >= n) {
                return Err(Error::InvalidSegment {
                    segment,
                    num_segments: n,
                });
            }
        }

        let id = self.next_scan_id.fetch_add(1, Ordering::Relaxed);
        let topology_id = self.ownership.topology_id();
        let tracker = Arc::new(KeyTracker::create(
            self.ownership.clone(),
            request.segments.as_ref(),
        ));
        let pending = match num_segments {
            Some(n) => request.segments.clone().unwrap_or_else(|| all_segments(n)),
            None => SegmentSet::new(),
        };

        let (sender, receiver) = mpsc::channel(request.batch_size);
        let token = CancellationToken::new();

        tracing::info!(
            scan_id = id,
            cache = %request.cache_name,
            topology_id,
            tracker = ?tracker.kind(),
            segments = pending.len(),
            batch_size = request.batch_size,
            "Starting scan"
        );
        self.metrics.scans_started.inc();

        let state = Arc::new(ScanState {
            id,
            segmented: num_segments.is_some(),
            request,
            transport: self.transport.clone(),
            ownership: self.ownership.clone(),
            metrics: self.metrics.clone(),
            tracker: tracker.clone(),
            pending: Mutex::new(pending),
            failed: Mutex::new(HashSet::new()),
            sender,
            token: token.clone(),
        });
        tokio::spawn(state.run());

        Ok(EntryStream::new(receiver, token, tracker, topology_id))
    }
}

impl std::fmt::Debug for IterationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IterationCoordinator")
            .field("topology_id", &self.ownership.topology_id())
            .field("scans_started", &(self.next_scan_id.load(Ordering::Relaxed) - 1))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanOutcome {
    Completed,
    Cancelled,
}

/// State shared by the coordinator loop and the workers of one scan.
pub(crate) struct ScanState {
    pub(crate) id: u64,
    segmented: bool,
    pub(crate) request: ScanRequest,
    pub(crate) transport: Arc<dyn IterationTransport>,
    ownership: Arc<dyn OwnershipView>,
    pub(crate) metrics: Arc<ClientMetrics>,
    pub(crate) tracker: Arc<KeyTracker>,
    /// Segments not yet reported complete; only shrinks.
    pending: Mutex<SegmentSet>,
    /// Servers that failed during this scan.
    failed: Mutex<HashSet<Address>>,
    pub(crate) sender: mpsc::Sender<Result<Entry>>,
    token: CancellationToken,
}

impl ScanState {
    async fn run(self: Arc<Self>) {
        let result = if self.segmented {
            self.clone().run_segmented().await
        } else {
            self.clone().run_unsegmented().await
        };

        match result {
            Ok(ScanOutcome::Completed) => {
                self.metrics.scans_completed.inc();
                match self.tracker.missed_segments() {
                    Some(missed) if !missed.is_empty() => {
                        tracing::warn!(
                            scan_id = self.id,
                            missed = ?missed,
                            "Scan completed without finishing some segments"
                        );
                    }
                    _ => tracing::info!(scan_id = self.id, "Scan completed"),
                }
            }
            Ok(ScanOutcome::Cancelled) => {
                tracing::debug!(scan_id = self.id, "Scan cancelled");
            }
            Err(e) => {
                self.metrics.scans_failed.inc();
                tracing::warn!(scan_id = self.id, error = %e, "Scan failed");
                let _ = self.sender.send(Err(e)).await;
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.sender.is_closed()
    }

    /// Caches without segment ownership: one worker against any server,
    /// reissued after transport failures until it completes or the caller
    /// cancels.
    async fn run_unsegmented(self: Arc<Self>) -> Result<ScanOutcome> {
        loop {
            if self.is_cancelled() {
                return Ok(ScanOutcome::Cancelled);
            }

            let worker = IterationWorker::new(
                self.clone(),
                Target::any(),
                self.request.segments.clone(),
                self.request.batch_size,
                self.token.child_token(),
            );
            match worker.run().await? {
                WorkerOutcome::Finished => return Ok(ScanOutcome::Completed),
                WorkerOutcome::Cancelled => return Ok(ScanOutcome::Cancelled),
                WorkerOutcome::TargetFailed(failed) => {
                    tracing::debug!(
                        scan_id = self.id,
                        failed = ?failed,
                        "Retrying scan against any server"
                    );
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Passes over the pending segments until none are left.
    async fn run_segmented(self: Arc<Self>) -> Result<ScanOutcome> {
        loop {
            if self.is_cancelled() {
                return Ok(ScanOutcome::Cancelled);
            }

            let pending = self.pending.lock().clone();
            if pending.is_empty() {
                return Ok(ScanOutcome::Completed);
            }

            let plan = self.plan_targets(&pending);
            let batch_size = per_target_batch_size(self.request.batch_size, plan.len());
            tracing::debug!(
                scan_id = self.id,
                targets = plan.len(),
                pending = pending.len(),
                batch_size,
                "Starting scan pass"
            );

            let mut workers = JoinSet::new();
            for (target, segments) in plan {
                let worker = IterationWorker::new(
                    self.clone(),
                    target,
                    Some(segments),
                    batch_size,
                    self.token.child_token(),
                );
                workers.spawn(worker.run());
            }

            let mut failure: Option<Error> = None;
            while let Some(joined) = workers.join_next().await {
                let outcome = joined
                    .map_err(|e| Error::Internal(format!("iteration worker panicked: {}", e)))
                    .and_then(|r| r);
                if let Err(e) = outcome {
                    // Let the other workers close their sessions before
                    // reporting the error.
                    self.token.cancel();
                    failure.get_or_insert(e);
                }
            }

            if let Some(e) = failure {
                return Err(e);
            }
        }
    }

    /// Assign pending segments to their live owners. Segments without a
    /// live owner go to any server not known to have failed.
    fn plan_targets(&self, pending: &SegmentSet) -> Vec<(Target, SegmentSet)> {
        let failed = self.failed.lock().clone();
        let mut owners: Vec<_> = self
            .ownership
            .owners()
            .into_iter()
            .filter(|(addr, _)| !failed.contains(addr))
            .collect();
        owners.sort_by_key(|(addr, _)| *addr);

        let mut covered = SegmentSet::new();
        let mut plan = Vec::with_capacity(owners.len() + 1);
        for (addr, owned) in owners {
            let assigned: SegmentSet = owned
                .intersection(pending)
                .filter(|s| !covered.contains(*s))
                .copied()
                .collect();
            if !assigned.is_empty() {
                covered.extend(&assigned);
                plan.push((Target::Node(addr), assigned));
            }
        }

        let orphaned: SegmentSet = pending.difference(&covered).copied().collect();
        if !orphaned.is_empty() {
            tracing::debug!(
                scan_id = self.id,
                segments = ?orphaned,
                excluded = ?failed,
                "No live owner for segments, sending to any server"
            );
            plan.push((Target::Any { exclude: failed }, orphaned));
        }
        plan
    }

    /// Record segments a server finished.
    pub(crate) fn segments_completed(&self, segments: &SegmentSet) {
        {
            let mut pending = self.pending.lock();
            for segment in segments {
                pending.remove(segment);
            }
        }
        self.tracker.segments_finished(segments);
    }

    pub(crate) fn mark_failed(&self, addr: Address) {
        self.failed.lock().insert(addr);
    }
}
