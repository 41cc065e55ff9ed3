//! Drives one target server through start / next / end for a subset of
//! segments.

use super::coordinator::ScanState;
use crate::error::{Error, Result};
use crate::transport::{IterationSession, StartIteration, Target};
use crate::types::{Address, SegmentSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How a worker ended without an error reaching the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorkerOutcome {
    /// The server returned all data for the assigned segments.
    Finished,
    /// The target failed; its segments remain pending.
    TargetFailed(Option<Address>),
    /// The scan was cancelled or the consumer went away.
    Cancelled,
}

pub(crate) struct IterationWorker {
    scan: Arc<ScanState>,
    target: Target,
    segments: Option<SegmentSet>,
    batch_size: usize,
    cancel: CancellationToken,
    session: Option<IterationSession>,
}

impl IterationWorker {
    pub(crate) fn new(
        scan: Arc<ScanState>,
        target: Target,
        segments: Option<SegmentSet>,
        batch_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            scan,
            target,
            segments,
            batch_size,
            cancel,
            session: None,
        }
    }

    /// Run the worker to completion.
    ///
    /// Node-local transport failures are absorbed and reported as
    /// [`WorkerOutcome::TargetFailed`]; every other error is returned.
    pub(crate) async fn run(mut self) -> Result<WorkerOutcome> {
        match self.iterate().await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_target_local() => {
                let failed = self.failed_address(&e);
                tracing::warn!(
                    scan_id = self.scan.id,
                    target = ?failed,
                    segments = ?self.segments,
                    error = %e,
                    "Iteration target failed, segments will be retried"
                );
                if let Some(addr) = failed {
                    self.scan.mark_failed(addr);
                }
                self.scan.metrics.target_failures.inc();
                Ok(WorkerOutcome::TargetFailed(failed))
            }
            Err(e) => {
                if let Some(session) = self.session.take() {
                    self.close(&session).await;
                }
                Err(e)
            }
        }
    }

    async fn iterate(&mut self) -> Result<WorkerOutcome> {
        let request = StartIteration {
            cache_name: self.scan.request.cache_name.clone(),
            filter: self.scan.request.filter.clone(),
            segments: self.segments.clone(),
            batch_size: self.batch_size,
            with_metadata: self.scan.request.with_metadata,
        };

        let session = self
            .scan
            .transport
            .start_iteration(&request, &self.target)
            .await?;
        tracing::debug!(
            scan_id = self.scan.id,
            target = %session.address,
            iteration_id = %session.id,
            segments = ?self.segments,
            batch_size = self.batch_size,
            "Started iteration"
        );
        self.session = Some(session.clone());

        // A cancel that raced the start response is applied now that the
        // session id is known.
        if self.cancel.is_cancelled() {
            self.close(&session).await;
            return Ok(WorkerOutcome::Cancelled);
        }

        loop {
            let batch = self.scan.transport.next_iteration(&session).await?;
            tracing::trace!(
                scan_id = self.scan.id,
                target = %session.address,
                entries = batch.entries.len(),
                completed = ?batch.completed_segments,
                has_more = batch.has_more,
                "Received iteration batch"
            );

            for entry in batch.entries {
                if !self.scan.tracker.track(&entry.key)? {
                    self.scan.metrics.duplicates_suppressed.inc();
                    continue;
                }
                tokio::select! {
                    sent = self.scan.sender.send(Ok(entry)) => {
                        if sent.is_err() {
                            tracing::debug!(scan_id = self.scan.id, "Consumer dropped the entry stream");
                            self.close(&session).await;
                            return Ok(WorkerOutcome::Cancelled);
                        }
                        self.scan.metrics.entries_delivered.inc();
                    }
                    _ = self.cancel.cancelled() => {
                        self.close(&session).await;
                        return Ok(WorkerOutcome::Cancelled);
                    }
                }
            }

            if !batch.completed_segments.is_empty() {
                self.scan.segments_completed(&batch.completed_segments);
            }

            if !batch.has_more {
                // Servers keep the session until it is explicitly ended.
                self.close(&session).await;
                self.session = None;
                if let Some(segments) = &self.segments {
                    self.scan.segments_completed(segments);
                }
                tracing::debug!(
                    scan_id = self.scan.id,
                    target = %session.address,
                    "Iteration target finished"
                );
                return Ok(WorkerOutcome::Finished);
            }

            if self.cancel.is_cancelled() {
                self.close(&session).await;
                return Ok(WorkerOutcome::Cancelled);
            }
        }
    }

    /// End the session, logging rather than failing on problems.
    async fn close(&self, session: &IterationSession) {
        match self.scan.transport.end_iteration(session).await {
            Ok(status) if status.is_success() || status.is_invalid_iteration() => {
                tracing::debug!(
                    scan_id = self.scan.id,
                    target = %session.address,
                    iteration_id = %session.id,
                    status = ?status,
                    "Ended iteration"
                );
            }
            Ok(status) => {
                tracing::warn!(
                    scan_id = self.scan.id,
                    target = %session.address,
                    iteration_id = %session.id,
                    status = ?status,
                    "Unexpected status ending iteration"
                );
            }
            Err(e) => {
                tracing::debug!(
                    scan_id = self.scan.id,
                    target = %session.address,
                    error = %e,
                    "Failed to end iteration"
                );
            }
        }
    }

    fn failed_address(&self, error: &Error) -> Option<Address> {
        self.session
            .as_ref()
            .map(|s| s.address)
            .or_else(|| error.failed_address())
            .or_else(|| self.target.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iteration::{IterationCoordinator, ScanRequest};
    use crate::metrics::ClientMetrics;
    use crate::partitioning::{OwnershipSnapshot, OwnershipTable};
    use crate::testing::wait_for;
    use crate::transport::{EndStatus, IterationBatch, IterationTransport};
    use crate::types::{Entry, IterationId};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn addr(port: u16) -> Address {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    /// One server returning a single entry per session. Starts can be held
    /// until the gate is opened.
    struct OneEntryServer {
        gate: Option<Notify>,
        end_status: EndStatus,
        starts: AtomicUsize,
        nexts: AtomicUsize,
        issued: Mutex<Vec<IterationSession>>,
        ended: Mutex<Vec<IterationSession>>,
    }

    impl OneEntryServer {
        fn new(gate: Option<Notify>, end_status: EndStatus) -> Self {
            Self {
                gate,
                end_status,
                starts: AtomicUsize::new(0),
                nexts: AtomicUsize::new(0),
                issued: Mutex::new(Vec::new()),
                ended: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl IterationTransport for OneEntryServer {
        async fn start_iteration(
            &self,
            _request: &StartIteration,
            target: &Target,
        ) -> Result<IterationSession> {
            let n = self.starts.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let session = IterationSession {
                id: IterationId::new(format!("session-{}", n)),
                address: target.address().unwrap_or_else(|| addr(1)),
            };
            self.issued.lock().push(session.clone());
            Ok(session)
        }

        async fn next_iteration(&self, _session: &IterationSession) -> Result<IterationBatch> {
            self.nexts.fetch_add(1, Ordering::SeqCst);
            Ok(IterationBatch {
                entries: vec![Entry::new("k", "v")],
                completed_segments: SegmentSet::new(),
                has_more: false,
            })
        }

        async fn end_iteration(&self, session: &IterationSession) -> Result<EndStatus> {
            self.ended.lock().push(session.clone());
            Ok(self.end_status.clone())
        }
    }

    fn coordinator(server: &Arc<OneEntryServer>, metrics: &Arc<ClientMetrics>) -> IterationCoordinator {
        let ownership = OwnershipTable::new(OwnershipSnapshot::from_primaries(1, &[addr(1), addr(1)]));
        IterationCoordinator::new(server.clone(), Arc::new(ownership), metrics.clone())
    }

    #[tokio::test]
    async fn test_cancel_before_start_response_ends_new_session() {
        let server = Arc::new(OneEntryServer::new(Some(Notify::new()), EndStatus::Success));
        let metrics = Arc::new(ClientMetrics::new());
        let coordinator = coordinator(&server, &metrics);

        let mut stream = coordinator.scan(ScanRequest::new("c", 10)).unwrap();
        assert!(wait_for(|| server.starts.load(Ordering::SeqCst) == 1, TIMEOUT).await);

        // The start response arrives only after the scan was cancelled.
        stream.cancel();
        if let Some(gate) = &server.gate {
            gate.notify_one();
        }

        assert!(wait_for(|| server.ended.lock().len() == 1, TIMEOUT).await);
        assert_eq!(*server.ended.lock(), *server.issued.lock());
        assert_eq!(server.nexts.load(Ordering::SeqCst), 0);
        assert!(stream.next().await.is_none());
        assert_eq!(metrics.entries_delivered.get(), 0);
    }

    #[tokio::test]
    async fn test_invalid_session_on_end_is_ignored() {
        let server = Arc::new(OneEntryServer::new(None, EndStatus::InvalidIteration));
        let metrics = Arc::new(ClientMetrics::new());
        let coordinator = coordinator(&server, &metrics);

        let entries = coordinator
            .scan(ScanRequest::new("c", 10))
            .unwrap()
            .collect()
            .await
            .unwrap();

        assert_eq!(entries, vec![Entry::new("k", "v")]);
        assert_eq!(server.ended.lock().len(), 1);
        assert!(wait_for(|| metrics.scans_completed.get() == 1, TIMEOUT).await);
        assert_eq!(metrics.scans_failed.get(), 0);
    }
}
