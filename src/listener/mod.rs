//! Client listeners for server-pushed cache events.
//!
//! Each listener is registered on one server and gets an
//! [`EventDispatcher`] bound to that server. When the server fails, the
//! [`ListenerRegistry`] stops the dispatcher, tells the application through
//! [`ClientListener::on_failover`], and registers the listener again on
//! another node. If no node accepts it, a reconnect loop retries at a fixed
//! period until one does.
//!
//! ```text
//!   Stopped ──start()──► Running ──stop()──► Stopped (cleanup ran once)
//!
//!   server failed ─► remove + stop ─► on_failover ─► register elsewhere
//!                                                     │ ok      │ retryable
//!                                                     ▼         ▼
//!                                                  Running   reconnect every period
//! ```

mod dispatcher;
mod event;
mod reconnect;
mod registry;

pub use dispatcher::{ClientListenerBehavior, DispatcherStatus, EventDispatcher, ListenerBehavior};
pub use event::{ChannelListener, ClientEvent, ClientListener, ListenerNotification, LoggingListener};
pub use reconnect::{ReconnectAttempt, ReconnectScheduler};
pub use registry::{FailoverOutcome, ListenerRegistry};

use crate::transport::FilterSpec;

/// Server-side options sent with a listener registration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListenerOptions {
    /// Filter deciding which events are sent.
    pub filter: Option<FilterSpec>,
    /// Converter turning events into custom payloads.
    pub converter: Option<FilterSpec>,
    /// Replay the current cache contents as created events on registration.
    pub include_current_state: bool,
    /// Deliver keys and values without unmarshalling.
    pub use_raw_data: bool,
}

impl ListenerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: FilterSpec) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_converter(mut self, converter: FilterSpec) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn with_include_current_state(mut self, enabled: bool) -> Self {
        self.include_current_state = enabled;
        self
    }

    pub fn with_raw_data(mut self, enabled: bool) -> Self {
        self.use_raw_data = enabled;
        self
    }
}
