//! Maps a backend reference (namespace, name, port) to a network location.

use crate::catalog::{ServiceCatalog, TargetRef};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("service {0}/{1} not found")]
    ServiceNotFound(String, String),
    #[error("service {0}/{1} does not expose port {2}")]
    PortNotFound(String, String, u16),
    #[error("no endpoints available for service {0}/{1}")]
    NoEndpoints(String, String),
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
}

pub trait ServiceResolver: Send + Sync {
    fn resolve(&self, namespace: &str, name: &str, port: u16) -> Result<Url, ResolveError>;
}

fn parse_url(raw: String) -> Result<Url, ResolveError> {
    Url::parse(&raw).map_err(|e| ResolveError::InvalidUrl(format!("{raw}: {e}")))
}

/// Resolves through the fabric's DNS: `scheme://name.namespace.svc[suffix]:port`.
/// Used when the gateway runs inside the same network as its backends.
pub struct ServiceDnsResolver {
    scheme: String,
    suffix: String,
}

impl ServiceDnsResolver {
    pub fn new(scheme: impl Into<String>, suffix: impl Into<String>) -> Self {
        ServiceDnsResolver {
            scheme: scheme.into(),
            suffix: suffix.into(),
        }
    }
}

impl ServiceResolver for ServiceDnsResolver {
    fn resolve(&self, namespace: &str, name: &str, port: u16) -> Result<Url, ResolveError> {
        parse_url(format!(
            "{}://{name}.{namespace}.svc{}:{port}",
            self.scheme, self.suffix
        ))
    }
}

/// Resolves to a live endpoint address from the catalog, bypassing service
/// virtual IPs. Used when the gateway runs outside the backends' network.
pub struct EndpointsResolver {
    scheme: String,
    catalog: Arc<dyn ServiceCatalog>,
}

impl EndpointsResolver {
    pub fn new(scheme: impl Into<String>, catalog: Arc<dyn ServiceCatalog>) -> Self {
        EndpointsResolver {
            scheme: scheme.into(),
            catalog,
        }
    }
}

impl ServiceResolver for EndpointsResolver {
    fn resolve(&self, namespace: &str, name: &str, port: u16) -> Result<Url, ResolveError> {
        let target = TargetRef::new(namespace, name);
        let service = self
            .catalog
            .get_service(&target)
            .ok_or_else(|| ResolveError::ServiceNotFound(namespace.into(), name.into()))?;

        if let Some(external_name) = &service.external_name {
            return parse_url(format!("{}://{external_name}:{port}", self.scheme));
        }

        let service_port = service
            .port(port)
            .ok_or_else(|| ResolveError::PortNotFound(namespace.into(), name.into(), port))?;

        let (address, endpoint_port) = self
            .catalog
            .get_endpoints(&target)
            .as_ref()
            .and_then(|endpoints| {
                endpoints
                    .address_for(&service_port.name)
                    .map(|(addr, p)| (addr.to_string(), p))
            })
            .ok_or_else(|| ResolveError::NoEndpoints(namespace.into(), name.into()))?;

        let host = if address.contains(':') {
            format!("[{address}]")
        } else {
            address
        };
        parse_url(format!("{}://{host}:{endpoint_port}", self.scheme))
    }
}
