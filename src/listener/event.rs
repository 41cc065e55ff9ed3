//! Events pushed by servers to registered client listeners.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A cache event delivered to a client listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientEvent {
    /// An entry was created.
    Created {
        key: Bytes,
        version: u64,
        /// Whether the event comes from a retried command and may be a
        /// duplicate.
        command_retried: bool,
    },

    /// An entry was modified.
    Modified {
        key: Bytes,
        version: u64,
        command_retried: bool,
    },

    /// An entry was removed.
    Removed { key: Bytes, command_retried: bool },

    /// An entry expired.
    Expired { key: Bytes },

    /// Payload produced by a server-side converter.
    Custom { data: Bytes },
}

impl ClientEvent {
    /// The key the event refers to, if it carries one.
    pub fn key(&self) -> Option<&Bytes> {
        match self {
            ClientEvent::Created { key, .. }
            | ClientEvent::Modified { key, .. }
            | ClientEvent::Removed { key, .. }
            | ClientEvent::Expired { key } => Some(key),
            ClientEvent::Custom { .. } => None,
        }
    }

    /// Short name of the event kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::Created { .. } => "created",
            ClientEvent::Modified { .. } => "modified",
            ClientEvent::Removed { .. } => "removed",
            ClientEvent::Expired { .. } => "expired",
            ClientEvent::Custom { .. } => "custom",
        }
    }
}

/// Application callback for cache events.
pub trait ClientListener: Send + Sync + 'static {
    /// Called for every event routed to this listener.
    fn on_event(&self, event: ClientEvent);

    /// Called when the server the listener was bound to became unreachable.
    /// Events may have been missed until the listener is re-registered.
    fn on_failover(&self) {}
}

/// What a [`ChannelListener`] forwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerNotification {
    Event(ClientEvent),
    Failover,
}

/// Listener forwarding everything to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ListenerNotification>,
}

impl ChannelListener {
    /// Create the listener and the receiving end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ListenerNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ClientListener for ChannelListener {
    fn on_event(&self, event: ClientEvent) {
        let _ = self.tx.send(ListenerNotification::Event(event));
    }

    fn on_failover(&self) {
        let _ = self.tx.send(ListenerNotification::Failover);
    }
}

/// Listener that logs events.
pub struct LoggingListener;

impl ClientListener for LoggingListener {
    fn on_event(&self, event: ClientEvent) {
        match &event {
            ClientEvent::Created { key, version, .. } | ClientEvent::Modified { key, version, .. } => {
                tracing::info!(kind = event.kind(), key = ?key, version, "Cache event");
            }
            ClientEvent::Removed { key, .. } | ClientEvent::Expired { key } => {
                tracing::info!(kind = event.kind(), key = ?key, "Cache event");
            }
            ClientEvent::Custom { data } => {
                tracing::debug!(len = data.len(), "Custom cache event");
            }
        }
    }

    fn on_failover(&self) {
        tracing::warn!("Listener server failed, events may have been missed");
    }
}
