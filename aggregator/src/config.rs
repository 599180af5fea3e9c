use crate::autoregister::DesiredRegistration;
use crate::catalog::{Endpoints, ServiceTarget};
use crate::local::LocalApiGroup;
use crate::types::ValidationError;
use crate::workqueue::Backoff;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

/// Aggregator configuration
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Listener for aggregated API traffic
    pub listener: Listener,
    /// Listener for `/health` and `/ready`
    pub admin_listener: Listener,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub openapi: OpenApiConfig,
    #[serde(default)]
    pub availability: AvailabilityConfig,
    #[serde(default)]
    pub workqueue: WorkQueueConfig,
    /// Group versions served by the gateway itself
    #[serde(default)]
    pub local_apis: Vec<LocalApiGroup>,
    /// Network targets known to the in-memory catalog
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
    /// Records kept in the store by the auto-register controller
    #[serde(default)]
    pub registrations: Vec<DesiredRegistration>,
}

impl Config {
    /// Returns the first problem found in the configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        for workers in [
            self.discovery.workers,
            self.openapi.workers,
            self.availability.workers,
        ] {
            if workers == 0 {
                return Err(ValidationError::NoWorkers);
            }
        }
        for timeout in [
            self.discovery.fetch_timeout_secs,
            self.openapi.fetch_timeout_secs,
            self.availability.probe_timeout_secs,
        ] {
            if timeout == 0 {
                return Err(ValidationError::InvalidTimeout);
            }
        }

        let mut local = HashSet::new();
        for group in &self.local_apis {
            let name = group.group_version().record_name();
            if !local.insert(name.clone()) {
                return Err(ValidationError::Duplicate(name));
            }
        }

        let mut services = HashSet::new();
        for entry in &self.services {
            let key = format!("{}/{}", entry.service.namespace, entry.service.name);
            if !services.insert(key.clone()) {
                return Err(ValidationError::Duplicate(key));
            }
            if entry.service.ports.iter().any(|p| p.port == 0) {
                return Err(ValidationError::InvalidPort);
            }
        }

        let mut names = HashSet::new();
        for desired in &self.registrations {
            let record = desired.to_record();
            record.validate()?;
            if !names.insert(record.name.clone()) {
                return Err(ValidationError::Duplicate(record.name));
            }
        }

        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolverKind {
    /// `scheme://name.namespace.svc<dns_suffix>:port`
    ServiceDns,
    /// A live endpoint address from the catalog
    Endpoints,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Answer upstream 3xx responses with an error instead of relaying them
    pub reject_forwarding_redirects: bool,
    pub backend_scheme: String,
    pub resolver: ResolverKind,
    pub dns_suffix: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            reject_forwarding_redirects: false,
            backend_scheme: "https".to_string(),
            resolver: ResolverKind::ServiceDns,
            dns_suffix: String::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub workers: usize,
    pub fetch_timeout_secs: u64,
    pub resync_interval_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            workers: 2,
            fetch_timeout_secs: 5,
            resync_interval_secs: 60,
        }
    }
}

impl DiscoveryConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OpenApiConfig {
    pub workers: usize,
    pub fetch_timeout_secs: u64,
    pub refresh_interval_secs: u64,
}

impl Default for OpenApiConfig {
    fn default() -> Self {
        OpenApiConfig {
            workers: 2,
            fetch_timeout_secs: 5,
            refresh_interval_secs: 60,
        }
    }
}

impl OpenApiConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AvailabilityConfig {
    pub workers: usize,
    pub probe_timeout_secs: u64,
    /// Parallel discovery requests per probe; any success passes
    pub probe_attempts: usize,
    pub resync_interval_secs: u64,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        AvailabilityConfig {
            workers: 5,
            probe_timeout_secs: 6,
            probe_attempts: 5,
            resync_interval_secs: 30,
        }
    }
}

impl AvailabilityConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WorkQueueConfig {
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        WorkQueueConfig {
            base_delay_ms: 5,
            max_delay_secs: 1000,
        }
    }
}

impl WorkQueueConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: Duration::from_millis(self.base_delay_ms.max(1)),
            max: Duration::from_secs(self.max_delay_secs.max(1)),
        }
    }
}

/// A network target and, unless it is an external name, its endpoints.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ServiceEntry {
    #[serde(flatten)]
    pub service: ServiceTarget,
    #[serde(default)]
    pub endpoints: Option<Endpoints>,
}
