//! Metrics for iteration and listener activity.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ClientMetrics                           │
//! │  ┌────────────────────────┐  ┌──────────────────────────┐  │
//! │  │  Iteration counters    │  │  Listener counters       │  │
//! │  │ - scans / entries      │  │ - failovers / reconnects │  │
//! │  │ - duplicates / retries │  │ - abandoned / active     │  │
//! │  └────────────────────────┘  └──────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod primitives;

pub use primitives::{Counter, Gauge};

/// Counters shared by the coordinator and the listener registry of one
/// client instance.
#[derive(Debug)]
pub struct ClientMetrics {
    /// Scans started.
    pub scans_started: Counter,
    /// Scans that delivered every segment.
    pub scans_completed: Counter,
    /// Scans aborted with an error.
    pub scans_failed: Counter,
    /// Entries handed to the consumer.
    pub entries_delivered: Counter,
    /// Redelivered entries dropped by key tracking.
    pub duplicates_suppressed: Counter,
    /// Iteration targets that failed and were retargeted.
    pub target_failures: Counter,

    /// Listeners moved off a failed server.
    pub listener_failovers: Counter,
    /// Reconnect attempts made by the scheduler.
    pub reconnect_attempts: Counter,
    /// Listeners given up after a non-retryable failover error.
    pub listeners_abandoned: Counter,
    /// Registered dispatchers.
    pub active_listeners: Gauge,
    /// Reconnect tasks currently scheduled.
    pub pending_reconnects: Gauge,
}

impl ClientMetrics {
    /// Create a zeroed metrics instance.
    pub fn new() -> Self {
        Self {
            scans_started: Counter::new("scans_started_total"),
            scans_completed: Counter::new("scans_completed_total"),
            scans_failed: Counter::new("scans_failed_total"),
            entries_delivered: Counter::new("scan_entries_delivered_total"),
            duplicates_suppressed: Counter::new("scan_duplicates_suppressed_total"),
            target_failures: Counter::new("scan_target_failures_total"),
            listener_failovers: Counter::new("listener_failovers_total"),
            reconnect_attempts: Counter::new("listener_reconnect_attempts_total"),
            listeners_abandoned: Counter::new("listeners_abandoned_total"),
            active_listeners: Gauge::new("listeners_active"),
            pending_reconnects: Gauge::new("listener_reconnects_pending"),
        }
    }

    /// Take a point-in-time copy of all values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            scans_started: self.scans_started.get(),
            scans_completed: self.scans_completed.get(),
            scans_failed: self.scans_failed.get(),
            entries_delivered: self.entries_delivered.get(),
            duplicates_suppressed: self.duplicates_suppressed.get(),
            target_failures: self.target_failures.get(),
            listener_failovers: self.listener_failovers.get(),
            reconnect_attempts: self.reconnect_attempts.get(),
            listeners_abandoned: self.listeners_abandoned.get(),
            active_listeners: self.active_listeners.get(),
            pending_reconnects: self.pending_reconnects.get(),
        }
    }
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`ClientMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub scans_started: u64,
    pub scans_completed: u64,
    pub scans_failed: u64,
    pub entries_delivered: u64,
    pub duplicates_suppressed: u64,
    pub target_failures: u64,
    pub listener_failovers: u64,
    pub reconnect_attempts: u64,
    pub listeners_abandoned: u64,
    pub active_listeners: i64,
    pub pending_reconnects: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_updates() {
        let metrics = ClientMetrics::new();
        metrics.scans_started.inc();
        metrics.entries_delivered.inc_by(10);
        metrics.active_listeners.inc();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.scans_started, 1);
        assert_eq!(snapshot.entries_delivered, 10);
        assert_eq!(snapshot.active_listeners, 1);
        assert_eq!(snapshot.scans_failed, 0);
    }
}
