//! Static configuration for a transaction manager domain.

use std::time::Duration;

use thiserror::Error;

/// Configuration validation failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Two resource entries share one key.
    #[error("duplicate resource key: {0}")]
    DuplicateResource(String),
    /// A resource entry asks for zero instances.
    #[error("resource {0} must have at least one instance")]
    NoInstances(String),
    /// A resource key is empty.
    #[error("resource key must not be empty")]
    EmptyKey,
    /// The transaction timeout is zero.
    #[error("transaction timeout must be positive")]
    ZeroTimeout,
}

/// One configured resource manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceConfig {
    /// Key identifying the resource within the domain.
    pub key: String,
    /// Open string passed to the resource's `open` entry point.
    pub openinfo: String,
    /// Close string passed to the resource's `close` entry point.
    pub closeinfo: String,
    /// Number of proxy instances serving this resource.
    pub instances: usize,
}

impl ResourceConfig {
    /// Creates an entry with one instance and empty open/close strings.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            openinfo: String::new(),
            closeinfo: String::new(),
            instances: 1,
        }
    }

    /// Sets the open string.
    pub fn openinfo(mut self, openinfo: impl Into<String>) -> Self {
        self.openinfo = openinfo.into();
        self
    }

    /// Sets the close string.
    pub fn closeinfo(mut self, closeinfo: impl Into<String>) -> Self {
        self.closeinfo = closeinfo.into();
        self
    }

    /// Sets the instance count.
    pub fn instances(mut self, instances: usize) -> Self {
        self.instances = instances;
        self
    }
}

/// Validated manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Resource managers served by this domain.
    pub resources: Vec<ResourceConfig>,
    /// Deadline applied to every transaction at begin.
    pub transaction_timeout: Duration,
    /// Cadence of the deadline sweep.
    pub sweep_interval: Duration,
}

impl ManagerConfig {
    /// Starts building a configuration.
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }
}

/// Builder for [`ManagerConfig`].
#[derive(Debug, Clone)]
pub struct ManagerConfigBuilder {
    resources: Vec<ResourceConfig>,
    transaction_timeout: Duration,
    sweep_interval: Duration,
}

impl Default for ManagerConfigBuilder {
    fn default() -> Self {
        Self {
            resources: Vec::new(),
            transaction_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl ManagerConfigBuilder {
    /// Adds a resource entry.
    pub fn resource(mut self, resource: ResourceConfig) -> Self {
        self.resources.push(resource);
        self
    }

    /// Sets the transaction deadline.
    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    /// Sets the deadline sweep cadence.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Validates and builds the configuration.
    pub fn build(self) -> Result<ManagerConfig, ConfigError> {
        if self.transaction_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        for (index, resource) in self.resources.iter().enumerate() {
            if resource.key.is_empty() {
                return Err(ConfigError::EmptyKey);
            }
            if resource.instances == 0 {
                return Err(ConfigError::NoInstances(resource.key.clone()));
            }
            if self.resources[..index].iter().any(|r| r.key == resource.key) {
                return Err(ConfigError::DuplicateResource(resource.key.clone()));
            }
        }
        Ok(ManagerConfig {
            resources: self.resources,
            transaction_timeout: self.transaction_timeout,
            sweep_interval: self.sweep_interval,
        })
    }
}
