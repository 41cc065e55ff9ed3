//! Listener id to dispatcher map, with server failover handling.

use super::dispatcher::{ClientListenerBehavior, EventDispatcher, ListenerBehavior};
use super::event::{ClientEvent, ClientListener};
use super::reconnect::{ReconnectAttempt, ReconnectScheduler};
use super::ListenerOptions;
use crate::config::ListenerConfig;
use crate::error::{Error, Result};
use crate::metrics::ClientMetrics;
use crate::transport::{ListenerRegistration, ListenerTransport};
use crate::types::{Address, ListenerId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How a failover of one listener ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverOutcome {
    /// Re-registered right away on the given server.
    Reconnected(Address),
    /// Registration failed with a retryable error; a reconnect loop runs.
    ReconnectScheduled,
    /// Registration failed for good; the listener gets no more events.
    Abandoned,
    /// No dispatcher was registered for the id.
    NotFound,
}

/// Tracks the dispatcher of every client listener and moves listeners to
/// another server when theirs fails.
pub struct ListenerRegistry {
    transport: Arc<dyn ListenerTransport>,
    config: ListenerConfig,
    metrics: Arc<ClientMetrics>,
    dispatchers: DashMap<ListenerId, Arc<EventDispatcher>>,
    reconnects: ReconnectScheduler,
}

impl ListenerRegistry {
    /// Create a registry.
    pub fn new(
        transport: Arc<dyn ListenerTransport>,
        config: ListenerConfig,
        metrics: Arc<ClientMetrics>,
    ) -> Arc<Self> {
        let reconnects = ReconnectScheduler::new(config.reconnect_period, metrics.clone());
        Arc::new(Self {
            transport,
            config,
            metrics,
            dispatchers: DashMap::new(),
            reconnects,
        })
    }

    /// Register an application listener on any live server and start
    /// dispatching its events. Returns the generated listener id.
    pub async fn add_client_listener(
        &self,
        cache_name: &str,
        listener: Arc<dyn ClientListener>,
        options: ListenerOptions,
    ) -> Result<ListenerId> {
        let listener_id = ListenerId::generate();
        self.add_client_listener_with_id(listener_id.clone(), cache_name, listener, options)
            .await?;
        Ok(listener_id)
    }

    /// Same as [`add_client_listener`](Self::add_client_listener) with a
    /// caller-chosen id. Returns the server the listener is bound to.
    ///
    /// Fails with [`Error::Config`] while the id has a dispatcher or a
    /// pending reconnect.
    pub async fn add_client_listener_with_id(
        &self,
        listener_id: ListenerId,
        cache_name: &str,
        listener: Arc<dyn ClientListener>,
        options: ListenerOptions,
    ) -> Result<Address> {
        if self.reconnects.is_scheduled(&listener_id) {
            return Err(Error::Config(format!(
                "listener {} is waiting to reconnect, remove it first",
                listener_id
            )));
        }

        let registration = ListenerRegistration {
            listener_id: listener_id.clone(),
            cache_name: cache_name.to_string(),
            options,
        };
        let behavior = Arc::new(ClientListenerBehavior::new(
            listener,
            registration,
            self.transport.clone(),
            self.config.max_registration_retries,
        ));
        self.install(listener_id, cache_name.to_string(), behavior, None)
            .await
    }

    /// Register `behavior` on a server and install a running dispatcher for
    /// it. A stopped placeholder receives events pushed while the
    /// registration is in flight. The id must not have a dispatcher yet.
    ///
    /// When `cancel` fires before the dispatcher is installed, or the
    /// placeholder was removed meanwhile, the server registration is undone
    /// and [`Error::Cancelled`] is returned.
    async fn install(
        &self,
        listener_id: ListenerId,
        cache_name: String,
        behavior: Arc<dyn ListenerBehavior>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Address> {
        let placeholder = Arc::new(EventDispatcher::pending(
            listener_id.clone(),
            cache_name.clone(),
            behavior.clone(),
        ));
        match self.dispatchers.entry(listener_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(placeholder.clone());
            }
            Entry::Occupied(_) => {
                return Err(Error::Config(format!(
                    "listener {} is already registered",
                    listener_id
                )));
            }
        }

        let addr = match placeholder.execute_registration().await {
            Ok(addr) => addr,
            Err(e) => {
                self.dispatchers
                    .remove_if(&listener_id, |_, d| Arc::ptr_eq(d, &placeholder));
                self.update_active_gauge();
                return Err(e);
            }
        };

        let transport = self.transport.clone();
        let release_id = listener_id.clone();
        let dispatcher = Arc::new(EventDispatcher::new(
            listener_id.clone(),
            cache_name.clone(),
            addr,
            behavior,
            move || transport.release_listener(addr, &release_id),
        ));

        let cancelled = cancel.map(|t| t.is_cancelled()).unwrap_or(false);
        let installed = match self.dispatchers.entry(listener_id.clone()) {
            Entry::Occupied(slot) if Arc::ptr_eq(slot.get(), &placeholder) && cancelled => {
                slot.remove();
                false
            }
            Entry::Occupied(mut slot) if Arc::ptr_eq(slot.get(), &placeholder) => {
                slot.insert(dispatcher.clone());
                true
            }
            _ => false,
        };
        if !installed {
            self.update_active_gauge();
            tracing::debug!(
                listener_id = %listener_id,
                address = %addr,
                "Listener removed while registering, unregistering from server"
            );
            if let Err(e) = self.transport.unregister_listener(&listener_id, addr).await {
                tracing::debug!(listener_id = %listener_id, error = %e, "Failed to unregister listener");
            }
            return Err(Error::Cancelled);
        }

        dispatcher.start();
        self.update_active_gauge();
        tracing::info!(
            listener_id = %listener_id,
            cache = %cache_name,
            address = %addr,
            "Listener registered"
        );
        Ok(addr)
    }

    /// Add a dispatcher built elsewhere. A dispatcher already registered for
    /// the same id is stopped and returned.
    pub fn add_dispatcher(&self, dispatcher: Arc<EventDispatcher>) -> Option<Arc<EventDispatcher>> {
        let replaced = self
            .dispatchers
            .insert(dispatcher.listener_id().clone(), dispatcher);
        if let Some(old) = &replaced {
            old.stop();
        }
        self.update_active_gauge();
        replaced
    }

    /// Start the dispatcher of a listener. Returns false if unknown or
    /// already running.
    pub fn start_client_listener(&self, listener_id: &ListenerId) -> bool {
        match self.dispatcher(listener_id) {
            Some(dispatcher) => dispatcher.start(),
            None => false,
        }
    }

    /// Remove a listener locally: cancel any pending reconnect and stop its
    /// dispatcher. The server registration is left alone.
    pub fn remove_client_listener(&self, listener_id: &ListenerId) -> Option<Arc<EventDispatcher>> {
        self.reconnects.cancel(listener_id);
        let removed = self.dispatchers.remove(listener_id).map(|(_, d)| d);
        if let Some(dispatcher) = &removed {
            dispatcher.stop();
            self.update_active_gauge();
        }
        removed
    }

    /// Remove a listener and unregister it from its server. Unregistration
    /// failures are logged, not returned. Returns whether it was registered
    /// or waiting to reconnect.
    pub async fn unregister_client_listener(&self, listener_id: &ListenerId) -> bool {
        let reconnect_cancelled = self.reconnects.cancel(listener_id);
        let Some(dispatcher) = self.remove_client_listener(listener_id) else {
            return reconnect_cancelled;
        };
        if let Some(addr) = dispatcher.address() {
            if let Err(e) = self.transport.unregister_listener(listener_id, addr).await {
                tracing::warn!(
                    listener_id = %listener_id,
                    address = %addr,
                    error = %e,
                    "Failed to unregister listener from server"
                );
            }
        }
        tracing::info!(listener_id = %listener_id, "Listener removed");
        true
    }

    /// Route a pushed event to the listener's dispatcher.
    pub fn invoke_event(&self, listener_id: &ListenerId, event: ClientEvent) -> Result<()> {
        let Some(dispatcher) = self.dispatcher(listener_id) else {
            tracing::error!(
                listener_id = %listener_id,
                kind = event.kind(),
                "Received event for unknown listener"
            );
            return Err(Error::ListenerNotFound(listener_id.clone()));
        };
        dispatcher.invoke_event(event);
        Ok(())
    }

    /// Whether the listener has a running dispatcher.
    pub fn is_listener_connected(&self, listener_id: &ListenerId) -> bool {
        self.dispatcher(listener_id)
            .map(|d| d.is_running())
            .unwrap_or(false)
    }

    /// Server the listener is currently bound to.
    pub fn find_address(&self, listener_id: &ListenerId) -> Option<Address> {
        self.dispatcher(listener_id).and_then(|d| d.address())
    }

    /// Ids of the listeners attached to a cache.
    pub fn listeners_for_cache(&self, cache_name: &str) -> Vec<ListenerId> {
        self.dispatchers
            .iter()
            .filter(|d| d.cache_name() == cache_name)
            .map(|d| d.key().clone())
            .collect()
    }

    pub fn dispatcher(&self, listener_id: &ListenerId) -> Option<Arc<EventDispatcher>> {
        self.dispatchers.get(listener_id).map(|d| d.value().clone())
    }

    /// Number of registered dispatchers.
    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }

    /// Whether a reconnect loop is running for the listener.
    pub fn is_reconnect_scheduled(&self, listener_id: &ListenerId) -> bool {
        self.reconnects.is_scheduled(listener_id)
    }

    /// Fail over every listener bound to one of the failed servers. Each
    /// failover runs on its own task; the affected ids are returned.
    pub fn failover_listeners(self: &Arc<Self>, failed: &HashSet<Address>) -> Vec<ListenerId> {
        let affected: Vec<ListenerId> = self
            .dispatchers
            .iter()
            .filter(|d| d.address().map(|a| failed.contains(&a)).unwrap_or(false))
            .map(|d| d.key().clone())
            .collect();

        if !affected.is_empty() {
            tracing::warn!(
                failed = ?failed,
                listeners = affected.len(),
                "Servers failed, failing over listeners"
            );
        }
        for listener_id in &affected {
            let registry = self.clone();
            let listener_id = listener_id.clone();
            tokio::spawn(async move {
                registry.failover_client_listener(&listener_id).await;
            });
        }
        affected
    }

    /// Move one listener off its failed server: remove and stop the old
    /// dispatcher, notify the application, then re-register. Retryable
    /// failures start a reconnect loop.
    pub async fn failover_client_listener(self: &Arc<Self>, listener_id: &ListenerId) -> FailoverOutcome {
        let Some(dispatcher) = self.remove_client_listener(listener_id) else {
            tracing::debug!(listener_id = %listener_id, "Listener already removed, skipping failover");
            return FailoverOutcome::NotFound;
        };
        self.metrics.listener_failovers.inc();
        tracing::warn!(
            listener_id = %listener_id,
            address = ?dispatcher.address(),
            "Failing over listener"
        );
        dispatcher.invoke_failover_event();

        if self.reconnects.is_shutdown() {
            self.abandon(listener_id, &Error::SchedulerShutdown);
            return FailoverOutcome::Abandoned;
        }

        let cache_name = dispatcher.cache_name().to_string();
        let behavior = dispatcher.behavior();
        match self
            .install(listener_id.clone(), cache_name.clone(), behavior.clone(), None)
            .await
        {
            Ok(addr) => FailoverOutcome::Reconnected(addr),
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    listener_id = %listener_id,
                    error = %e,
                    period_ms = self.config.reconnect_period.as_millis() as u64,
                    "Listener failover failed, scheduling reconnect"
                );
                match self.schedule_reconnect(listener_id.clone(), cache_name, behavior) {
                    Ok(()) => FailoverOutcome::ReconnectScheduled,
                    Err(e) => {
                        self.abandon(listener_id, &e);
                        FailoverOutcome::Abandoned
                    }
                }
            }
            Err(e) => {
                self.abandon(listener_id, &e);
                FailoverOutcome::Abandoned
            }
        }
    }

    fn schedule_reconnect(
        self: &Arc<Self>,
        listener_id: ListenerId,
        cache_name: String,
        behavior: Arc<dyn ListenerBehavior>,
    ) -> Result<()> {
        let registry = Arc::downgrade(self);
        let id = listener_id.clone();
        self.reconnects.schedule(listener_id, move |token| {
            let registry = registry.clone();
            let listener_id = id.clone();
            let cache_name = cache_name.clone();
            let behavior = behavior.clone();
            async move {
                match registry.upgrade() {
                    Some(registry) => {
                        registry
                            .reconnect(listener_id, cache_name, behavior, &token)
                            .await
                    }
                    None => ReconnectAttempt::Done,
                }
            }
        })
    }

    async fn reconnect(
        &self,
        listener_id: ListenerId,
        cache_name: String,
        behavior: Arc<dyn ListenerBehavior>,
        token: &CancellationToken,
    ) -> ReconnectAttempt {
        if self.dispatchers.contains_key(&listener_id) {
            tracing::debug!(listener_id = %listener_id, "Listener registered again, stopping reconnect");
            return ReconnectAttempt::Done;
        }
        self.metrics.reconnect_attempts.inc();
        match self
            .install(listener_id.clone(), cache_name, behavior, Some(token))
            .await
        {
            Ok(addr) => {
                tracing::info!(listener_id = %listener_id, address = %addr, "Listener reconnected");
                ReconnectAttempt::Done
            }
            Err(e) if e.is_retryable() => {
                tracing::debug!(listener_id = %listener_id, error = %e, "Listener reconnect failed");
                ReconnectAttempt::Retry
            }
            Err(e) => {
                self.abandon(&listener_id, &e);
                ReconnectAttempt::Done
            }
        }
    }

    fn abandon(&self, listener_id: &ListenerId, error: &Error) {
        if matches!(error, Error::Cancelled) {
            tracing::debug!(listener_id = %listener_id, "Listener removed during failover");
            return;
        }
        self.metrics.listeners_abandoned.inc();
        tracing::error!(
            listener_id = %listener_id,
            error = %error,
            "Giving up on listener, it will not receive further events"
        );
    }

    /// Stop scheduling reconnects. Failovers after this abandon the
    /// listener with [`Error::SchedulerShutdown`].
    pub fn shutdown(&self) {
        self.reconnects.shutdown();
    }

    /// Stop and remove every dispatcher.
    pub fn clear(&self) {
        let ids: Vec<ListenerId> = self.dispatchers.iter().map(|d| d.key().clone()).collect();
        for listener_id in ids {
            self.remove_client_listener(&listener_id);
        }
    }

    fn update_active_gauge(&self) {
        self.metrics
            .active_listeners
            .set(self.dispatchers.len() as i64);
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.dispatchers.len())
            .field("pending_reconnects", &self.reconnects.pending())
            .field("config", &self.config)
            .finish()
    }
}
