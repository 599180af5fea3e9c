pub mod apiserver;
pub mod autoregister;
pub mod availability;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod errors;
pub mod http;
pub mod local;
pub mod metrics_defs;
pub mod openapi;
pub mod proxy;
pub mod registry;
pub mod store;
pub mod types;
pub mod version;
pub mod workqueue;

#[cfg(test)]
mod testutils;

use crate::apiserver::{Aggregator, AggregatorSettings, GatewayService};
use crate::autoregister::AutoRegisterController;
use crate::availability::local::LocalAvailabilityController;
use crate::availability::{AvailabilityController, ProbeSettings};
use crate::catalog::{InMemoryCatalog, ServiceCatalog, TargetRef};
use crate::config::{Config, ResolverKind};
use crate::controller::ReconciliationController;
use crate::local::StaticApis;
use crate::proxy::resolver::{EndpointsResolver, ServiceDnsResolver, ServiceResolver};
use crate::registry::ServiceRegistry;
use crate::store::{InMemoryStore, RecordStore};
use errors::{AggregatorError, Result};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

fn build_catalog(config: &Config) -> Arc<InMemoryCatalog> {
    let catalog = Arc::new(InMemoryCatalog::new());
    for entry in &config.services {
        catalog.set_service(entry.service.clone());
        if let Some(endpoints) = &entry.endpoints {
            catalog.set_endpoints(
                TargetRef::new(&entry.service.namespace, &entry.service.name),
                endpoints.clone(),
            );
        }
    }
    catalog
}

fn build_resolver(config: &Config, catalog: Arc<dyn ServiceCatalog>) -> Arc<dyn ServiceResolver> {
    let scheme = config.proxy.backend_scheme.clone();
    match config.proxy.resolver {
        ResolverKind::ServiceDns => Arc::new(ServiceDnsResolver::new(scheme, config.proxy.dns_suffix.clone())),
        ResolverKind::Endpoints => Arc::new(EndpointsResolver::new(scheme, catalog)),
    }
}

/// Runs the gateway until `shutdown` fires or a listener fails.
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<()> {
    let backoff = config.workqueue.backoff();
    let store: Arc<dyn RecordStore> = Arc::new(InMemoryStore::new());
    let catalog = build_catalog(&config);
    let resolver = build_resolver(&config, catalog.clone());
    let registry = Arc::new(ServiceRegistry::new());

    let aggregator = Arc::new(Aggregator::new(
        Arc::new(StaticApis::new(config.local_apis.clone())),
        resolver.clone(),
        AggregatorSettings {
            reject_forwarding_redirects: config.proxy.reject_forwarding_redirects,
            discovery_fetch_timeout: config.discovery.fetch_timeout(),
            openapi_fetch_timeout: config.openapi.fetch_timeout(),
            openapi_refresh_interval: config.openapi.refresh_interval(),
            backoff,
        },
    ));
    let reconciler = Arc::new(ReconciliationController::new(
        registry.clone(),
        aggregator.clone(),
        backoff,
    ));
    let local_availability = Arc::new(LocalAvailabilityController::new(
        registry.clone(),
        store.clone(),
        backoff,
    ));
    let availability = Arc::new(AvailabilityController::new(
        registry.clone(),
        store.clone(),
        catalog,
        resolver,
        ProbeSettings {
            timeout: Duration::from_secs(config.availability.probe_timeout_secs),
            attempts: config.availability.probe_attempts,
        },
        backoff,
    ));
    let autoregister = Arc::new(AutoRegisterController::new(
        registry.clone(),
        store.clone(),
        backoff,
    ));
    for desired in &config.registrations {
        autoregister.add_desired(desired.clone());
    }

    let mut tasks = JoinSet::new();
    tasks.spawn(registry.run(store, shutdown.clone()));
    tasks.spawn(reconciler.clone().run(shutdown.clone()));
    tasks.spawn(aggregator.discovery().run(
        config.discovery.workers,
        config.discovery.resync_interval(),
        shutdown.clone(),
    ));
    tasks.spawn(aggregator.spec_sync().run(config.openapi.workers, shutdown.clone()));
    tasks.spawn(local_availability.run(shutdown.clone()));
    tasks.spawn(availability.run(
        config.availability.workers,
        config.availability.resync_interval(),
        shutdown.clone(),
    ));
    tasks.spawn(autoregister.run(shutdown.clone()));

    let ready = reconciler.clone();
    let admin = AdminService::<_, AggregatorError>::new(move || ready.is_ready());

    let result = tokio::select! {
        result = run_http_service(
            &config.listener.host,
            config.listener.port,
            GatewayService::new(aggregator),
        ) => result,
        result = run_http_service(
            &config.admin_listener.host,
            config.admin_listener.port,
            admin,
        ) => result,
        _ = shutdown.cancelled() => Ok(()),
    };

    shutdown.cancel();
    while tasks.join_next().await.is_some() {}
    tracing::info!("Gateway stopped");
    result
}
