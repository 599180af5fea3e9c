//! Network targets (services and their endpoints) that records point at.

use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetRef {
    pub namespace: String,
    pub name: String,
}

impl TargetRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        TargetRef {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServicePort {
    #[serde(default)]
    pub name: String,
    pub port: u16,
    /// Port on the endpoints; defaults to `port`.
    #[serde(default)]
    pub target_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServiceTarget {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    /// DNS name of a target living outside the fabric. Such targets have no
    /// endpoints.
    #[serde(default)]
    pub external_name: Option<String>,
}

impl ServiceTarget {
    pub fn port(&self, port: u16) -> Option<&ServicePort> {
        self.ports.iter().find(|p| p.port == port)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EndpointPort {
    #[serde(default)]
    pub name: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EndpointSubset {
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Endpoints {
    #[serde(default)]
    pub subsets: Vec<EndpointSubset>,
}

impl Endpoints {
    /// First live address exposing the service port named `port_name`, with the
    /// endpoint port it is reachable on.
    pub fn address_for(&self, port_name: &str) -> Option<(&str, u16)> {
        self.subsets.iter().find_map(|subset| {
            let port = subset.ports.iter().find(|p| p.name == port_name)?;
            let address = subset.addresses.first()?;
            Some((address.as_str(), port.port))
        })
    }
}

pub trait ServiceCatalog: Send + Sync {
    fn get_service(&self, target: &TargetRef) -> Option<ServiceTarget>;

    fn get_endpoints(&self, target: &TargetRef) -> Option<Endpoints>;

    /// Notifies about targets whose service or endpoints changed.
    fn subscribe(&self) -> broadcast::Receiver<TargetRef>;
}

pub struct InMemoryCatalog {
    services: RwLock<HashMap<TargetRef, ServiceTarget>>,
    endpoints: RwLock<HashMap<TargetRef, Endpoints>>,
    changes: broadcast::Sender<TargetRef>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        InMemoryCatalog {
            services: RwLock::new(HashMap::new()),
            endpoints: RwLock::new(HashMap::new()),
            changes,
        }
    }

    pub fn set_service(&self, service: ServiceTarget) {
        let target = TargetRef::new(&service.namespace, &service.name);
        self.services.write().insert(target.clone(), service);
        let _ = self.changes.send(target);
    }

    pub fn remove_service(&self, target: &TargetRef) {
        self.services.write().remove(target);
        let _ = self.changes.send(target.clone());
    }

    pub fn set_endpoints(&self, target: TargetRef, endpoints: Endpoints) {
        self.endpoints.write().insert(target.clone(), endpoints);
        let _ = self.changes.send(target);
    }
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        InMemoryCatalog::new()
    }
}

impl ServiceCatalog for InMemoryCatalog {
    fn get_service(&self, target: &TargetRef) -> Option<ServiceTarget> {
        self.services.read().get(target).cloned()
    }

    fn get_endpoints(&self, target: &TargetRef) -> Option<Endpoints> {
        self.endpoints.read().get(target).cloned()
    }

    fn subscribe(&self) -> broadcast::Receiver<TargetRef> {
        self.changes.subscribe()
    }
}
