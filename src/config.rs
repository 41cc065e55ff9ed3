//! Configuration types for the cache client.

use crate::error::{Error, Result};
use std::time::Duration;

/// Main configuration for the cache client.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Entry iteration configuration.
    pub iteration: IterationConfig,

    /// Client listener configuration.
    pub listener: ListenerConfig,
}

impl ClientConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set iteration configuration.
    pub fn with_iteration_config(mut self, iteration: IterationConfig) -> Self {
        self.iteration = iteration;
        self
    }

    /// Set listener configuration.
    pub fn with_listener_config(mut self, listener: ListenerConfig) -> Self {
        self.listener = listener;
        self
    }

    /// Set the default iteration batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.iteration.batch_size = batch_size;
        self
    }

    /// Set the listener reconnect period.
    pub fn with_reconnect_period(mut self, period: Duration) -> Self {
        self.listener.reconnect_period = period;
        self
    }

    /// Check the configuration for values the client cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.iteration.batch_size == 0 {
            return Err(Error::Config("iteration batch size must be positive".into()));
        }
        if self.listener.reconnect_period.is_zero() {
            return Err(Error::Config("listener reconnect period must be positive".into()));
        }
        Ok(())
    }
}

/// Entry iteration configuration.
#[derive(Debug, Clone)]
pub struct IterationConfig {
    /// Total number of entries requested per round trip, split across targets.
    pub batch_size: usize,

    /// Whether scans return entry metadata unless the request says otherwise.
    pub with_metadata: bool,
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            with_metadata: false,
        }
    }
}

impl IterationConfig {
    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Request entry metadata by default.
    pub fn with_metadata(mut self, enabled: bool) -> Self {
        self.with_metadata = enabled;
        self
    }
}

/// Client listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Period between reconnect attempts after a failed failover.
    pub reconnect_period: Duration,

    /// Number of additional nodes tried when a registration fails.
    pub max_registration_retries: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            reconnect_period: Duration::from_millis(5000),
            max_registration_retries: 3,
        }
    }
}

impl ListenerConfig {
    /// Set the reconnect period.
    pub fn with_reconnect_period(mut self, period: Duration) -> Self {
        self.reconnect_period = period;
        self
    }

    /// Set the maximum number of registration retries.
    pub fn with_max_registration_retries(mut self, retries: usize) -> Self {
        self.max_registration_retries = retries;
        self
    }
}
