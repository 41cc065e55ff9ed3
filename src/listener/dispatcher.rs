//! Per-listener event dispatcher bound to one server.

use super::event::{ClientEvent, ClientListener};
use crate::error::Result;
use crate::transport::{ListenerRegistration, ListenerTransport, Target};
use crate::types::{Address, ListenerId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Lifecycle of a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherStatus {
    Stopped,
    Running,
}

/// What a dispatcher does with events, failovers and re-registration.
#[async_trait]
pub trait ListenerBehavior: Send + Sync + 'static {
    /// Deliver an event to the application.
    fn invoke_event(&self, event: ClientEvent);

    /// Tell the application that its server failed.
    fn invoke_failover_event(&self);

    /// Register the listener on a live server and return the bound address.
    async fn register(&self) -> Result<Address>;
}

type Cleanup = Box<dyn FnOnce() + Send>;

/// Routes push events for one listener id. Bound to the server the listener
/// was registered on; a fresh dispatcher is created after every failover.
pub struct EventDispatcher {
    listener_id: ListenerId,
    cache_name: String,
    address: Option<Address>,
    status: Mutex<DispatcherStatus>,
    cleanup: Mutex<Option<Cleanup>>,
    behavior: Arc<dyn ListenerBehavior>,
}

impl EventDispatcher {
    /// Create a stopped dispatcher bound to `address`. `cleanup` runs once,
    /// on the first `stop()` after `start()`.
    pub fn new(
        listener_id: ListenerId,
        cache_name: impl Into<String>,
        address: Address,
        behavior: Arc<dyn ListenerBehavior>,
        cleanup: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            listener_id,
            cache_name: cache_name.into(),
            address: Some(address),
            status: Mutex::new(DispatcherStatus::Stopped),
            cleanup: Mutex::new(Some(Box::new(cleanup))),
            behavior,
        }
    }

    /// Dispatcher installed while its registration is still in flight, so
    /// events pushed before the registration response are not lost.
    pub(crate) fn pending(
        listener_id: ListenerId,
        cache_name: impl Into<String>,
        behavior: Arc<dyn ListenerBehavior>,
    ) -> Self {
        Self {
            listener_id,
            cache_name: cache_name.into(),
            address: None,
            status: Mutex::new(DispatcherStatus::Stopped),
            cleanup: Mutex::new(None),
            behavior,
        }
    }

    pub fn listener_id(&self) -> &ListenerId {
        &self.listener_id
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Server the listener is registered on, `None` while registering.
    pub fn address(&self) -> Option<Address> {
        self.address
    }

    pub fn status(&self) -> DispatcherStatus {
        *self.status.lock()
    }

    pub fn is_running(&self) -> bool {
        self.status() == DispatcherStatus::Running
    }

    pub(crate) fn behavior(&self) -> Arc<dyn ListenerBehavior> {
        self.behavior.clone()
    }

    /// Start dispatching. Returns false if already running.
    pub fn start(&self) -> bool {
        let mut status = self.status.lock();
        if *status == DispatcherStatus::Running {
            return false;
        }
        *status = DispatcherStatus::Running;
        tracing::debug!(
            listener_id = %self.listener_id,
            address = ?self.address,
            "Started listener dispatcher"
        );
        true
    }

    /// Stop dispatching and release the routing on the server channel.
    /// Returns true only for the call that performed the transition.
    pub fn stop(&self) -> bool {
        {
            let mut status = self.status.lock();
            if *status == DispatcherStatus::Stopped {
                return false;
            }
            *status = DispatcherStatus::Stopped;
        }
        if let Some(cleanup) = self.cleanup.lock().take() {
            cleanup();
        }
        tracing::debug!(
            listener_id = %self.listener_id,
            address = ?self.address,
            "Stopped listener dispatcher"
        );
        true
    }

    /// Deliver an event. Not gated on status: events already in flight when
    /// the dispatcher stops are still handed to the application.
    pub fn invoke_event(&self, event: ClientEvent) {
        if !self.is_running() {
            tracing::trace!(
                listener_id = %self.listener_id,
                kind = event.kind(),
                "Delivering event to stopped dispatcher"
            );
        }
        self.behavior.invoke_event(event);
    }

    pub fn invoke_failover_event(&self) {
        self.behavior.invoke_failover_event();
    }

    /// Register the listener on a live server through its behavior. Runs
    /// for the first registration and again for every failover and
    /// reconnect attempt.
    pub async fn execute_registration(&self) -> Result<Address> {
        self.behavior.register().await
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listener_id", &self.listener_id)
            .field("cache_name", &self.cache_name)
            .field("address", &self.address)
            .field("status", &self.status())
            .finish()
    }
}

/// Behavior backing application listeners added through the registry.
pub struct ClientListenerBehavior {
    listener: Arc<dyn ClientListener>,
    registration: ListenerRegistration,
    transport: Arc<dyn ListenerTransport>,
    max_retries: usize,
}

impl ClientListenerBehavior {
    pub fn new(
        listener: Arc<dyn ClientListener>,
        registration: ListenerRegistration,
        transport: Arc<dyn ListenerTransport>,
        max_retries: usize,
    ) -> Self {
        Self {
            listener,
            registration,
            transport,
            max_retries,
        }
    }
}

#[async_trait]
impl ListenerBehavior for ClientListenerBehavior {
    fn invoke_event(&self, event: ClientEvent) {
        self.listener.on_event(event);
    }

    fn invoke_failover_event(&self) {
        self.listener.on_failover();
    }

    async fn register(&self) -> Result<Address> {
        register_with_retries(self.transport.as_ref(), &self.registration, self.max_retries).await
    }
}

/// Register on any live server. Node-local failures are retried up to
/// `max_retries` times, each time excluding the servers that failed.
pub(crate) async fn register_with_retries(
    transport: &dyn ListenerTransport,
    registration: &ListenerRegistration,
    max_retries: usize,
) -> Result<Address> {
    let mut excluded = HashSet::new();
    let mut retries = 0;
    loop {
        let target = Target::Any {
            exclude: excluded.clone(),
        };
        match transport.register_listener(registration, &target).await {
            Ok(addr) => {
                tracing::debug!(
                    listener_id = %registration.listener_id,
                    cache = %registration.cache_name,
                    address = %addr,
                    retries,
                    "Registered listener"
                );
                return Ok(addr);
            }
            Err(e) if e.is_target_local() && retries < max_retries => {
                retries += 1;
                tracing::warn!(
                    listener_id = %registration.listener_id,
                    failed = ?e.failed_address(),
                    retries,
                    error = %e,
                    "Listener registration failed, retrying on another server"
                );
                if let Some(addr) = e.failed_address() {
                    excluded.insert(addr);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBehavior {
        events: AtomicUsize,
        failovers: AtomicUsize,
    }

    #[async_trait]
    impl ListenerBehavior for CountingBehavior {
        fn invoke_event(&self, _event: ClientEvent) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }

        fn invoke_failover_event(&self) {
            self.failovers.fetch_add(1, Ordering::SeqCst);
        }

        async fn register(&self) -> Result<Address> {
            Ok("127.0.0.1:11222".parse().unwrap())
        }
    }

    fn dispatcher(cleanups: Arc<AtomicUsize>) -> (EventDispatcher, Arc<CountingBehavior>) {
        let behavior = Arc::new(CountingBehavior::default());
        let dispatcher = EventDispatcher::new(
            ListenerId::from_static(b"l1"),
            "c",
            "127.0.0.1:11222".parse().unwrap(),
            behavior.clone(),
            move || {
                cleanups.fetch_add(1, Ordering::SeqCst);
            },
        );
        (dispatcher, behavior)
    }

    #[test]
    fn test_stop_is_idempotent_and_cleans_up_once() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let (dispatcher, _) = dispatcher(cleanups.clone());

        assert!(!dispatcher.stop());
        assert!(dispatcher.start());
        assert!(!dispatcher.start());
        assert!(dispatcher.stop());
        assert!(!dispatcher.stop());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.status(), DispatcherStatus::Stopped);
    }

    #[test]
    fn test_events_delivered_after_stop() {
        let (dispatcher, behavior) = dispatcher(Arc::new(AtomicUsize::new(0)));
        dispatcher.start();
        dispatcher.stop();

        dispatcher.invoke_event(ClientEvent::Expired {
            key: bytes::Bytes::from_static(b"k"),
        });
        dispatcher.invoke_failover_event();
        assert_eq!(behavior.events.load(Ordering::SeqCst), 1);
        assert_eq!(behavior.failovers.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_registration_goes_through_behavior() {
        let (dispatcher, _) = dispatcher(Arc::new(AtomicUsize::new(0)));
        let addr = dispatcher.execute_registration().await.unwrap();
        assert_eq!(addr, "127.0.0.1:11222".parse::<Address>().unwrap());
    }

    #[test]
    fn test_pending_dispatcher_has_no_address() {
        let behavior = Arc::new(CountingBehavior::default());
        let pending = EventDispatcher::pending(ListenerId::from_static(b"l1"), "c", behavior);
        assert_eq!(pending.address(), None);
        assert!(pending.start());
        assert!(pending.stop());
    }
}
