//! Client facade tying iteration and listeners to one set of transports.

use crate::config::ClientConfig;
use crate::error::Result;
use crate::iteration::{EntryStream, IterationCoordinator, ScanRequest};
use crate::listener::{ClientListener, ListenerOptions, ListenerRegistry};
use crate::metrics::{ClientMetrics, MetricsSnapshot};
use crate::partitioning::{OwnershipSnapshot, OwnershipTable};
use crate::transport::{IterationTransport, ListenerTransport};
use crate::types::{Address, ListenerId};
use std::collections::HashSet;
use std::sync::Arc;

/// Cluster notifications fed to the client by the connection layer.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A server became unreachable.
    ServerFailed { addr: Address },

    /// Several servers became unreachable at once.
    ServersFailed { addrs: HashSet<Address> },

    /// A new segment ownership map was received.
    TopologyChanged { snapshot: OwnershipSnapshot },
}

impl ServerEvent {
    /// Servers reported as failed by this event.
    pub fn failed_servers(&self) -> HashSet<Address> {
        match self {
            ServerEvent::ServerFailed { addr } => HashSet::from([*addr]),
            ServerEvent::ServersFailed { addrs } => addrs.clone(),
            ServerEvent::TopologyChanged { .. } => HashSet::new(),
        }
    }
}

/// Remote cache client: scans and listeners over shared transports and
/// ownership.
///
/// ```rust,ignore
/// let client = RemoteClient::new(config, transport.clone(), transport, ownership)?;
/// let entries = client.scan(client.scan_request("users"))?.collect().await?;
/// let id = client.add_listener("users", Arc::new(LoggingListener), ListenerOptions::default()).await?;
/// ```
pub struct RemoteClient {
    config: ClientConfig,
    ownership: Arc<OwnershipTable>,
    coordinator: IterationCoordinator,
    registry: Arc<ListenerRegistry>,
    metrics: Arc<ClientMetrics>,
}

impl RemoteClient {
    /// Create a client. Fails if the configuration is invalid.
    pub fn new(
        config: ClientConfig,
        iteration: Arc<dyn IterationTransport>,
        listeners: Arc<dyn ListenerTransport>,
        ownership: Arc<OwnershipTable>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(ClientMetrics::new());
        let coordinator = IterationCoordinator::new(iteration, ownership.clone(), metrics.clone());
        let registry = ListenerRegistry::new(listeners, config.listener.clone(), metrics.clone());

        tracing::info!(
            topology_id = ownership.snapshot().topology_id(),
            batch_size = config.iteration.batch_size,
            reconnect_period_ms = config.listener.reconnect_period.as_millis() as u64,
            "Remote client created"
        );

        Ok(Self {
            config,
            ownership,
            coordinator,
            registry,
            metrics,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// A scan of the whole cache with the configured defaults.
    pub fn scan_request(&self, cache_name: impl Into<String>) -> ScanRequest {
        ScanRequest::new(cache_name, self.config.iteration.batch_size)
            .with_metadata(self.config.iteration.with_metadata)
    }

    /// Start a scan.
    pub fn scan(&self, request: ScanRequest) -> Result<EntryStream> {
        self.coordinator.scan(request)
    }

    /// Register a listener on the cache.
    pub async fn add_listener(
        &self,
        cache_name: &str,
        listener: Arc<dyn ClientListener>,
        options: ListenerOptions,
    ) -> Result<ListenerId> {
        self.registry
            .add_client_listener(cache_name, listener, options)
            .await
    }

    /// Remove a listener and unregister it from its server.
    pub async fn remove_listener(&self, listener_id: &ListenerId) -> bool {
        self.registry.unregister_client_listener(listener_id).await
    }

    pub fn is_listener_connected(&self, listener_id: &ListenerId) -> bool {
        self.registry.is_listener_connected(listener_id)
    }

    pub fn listener_address(&self, listener_id: &ListenerId) -> Option<Address> {
        self.registry.find_address(listener_id)
    }

    pub fn listeners_for_cache(&self, cache_name: &str) -> Vec<ListenerId> {
        self.registry.listeners_for_cache(cache_name)
    }

    /// The listener registry, for routing pushed events.
    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    pub fn ownership(&self) -> &Arc<OwnershipTable> {
        &self.ownership
    }

    /// React to a cluster notification. Returns the listeners being failed
    /// over.
    pub fn handle_server_event(&self, event: ServerEvent) -> Vec<ListenerId> {
        match event {
            ServerEvent::TopologyChanged { snapshot } => {
                let topology_id = snapshot.topology_id();
                if self.ownership.update(snapshot) {
                    tracing::info!(topology_id, "Topology updated");
                } else {
                    tracing::debug!(topology_id, "Ignoring stale topology");
                }
                Vec::new()
            }
            event => {
                let failed = event.failed_servers();
                tracing::warn!(failed = ?failed, "Servers failed");
                self.registry.failover_listeners(&failed)
            }
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop reconnecting listeners and stop every dispatcher.
    pub fn shutdown(&self) {
        tracing::info!(listeners = self.registry.len(), "Shutting down remote client");
        self.registry.shutdown();
        self.registry.clear();
    }
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("config", &self.config)
            .field("coordinator", &self.coordinator)
            .field("registry", &self.registry)
            .finish()
    }
}
