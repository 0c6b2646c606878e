//! # Control Plane Bootstrap
//!
//! Wires the persistence gateway, registries, state machines, executor, dispatcher,
//! container manager and reconciliation engine into one [`ControlPlane`] handle.
//!
//! Registries are filled through the builder and frozen by [`ControlPlaneBuilder::build`];
//! nothing is registered after startup.
//!
//! ```rust
//! use cloudmgr_core::config::{ConfigManager, CoreConfig};
//! use cloudmgr_core::orchestration::ControlPlane;
//! use cloudmgr_core::test_helpers::{FakeDriver, FakePlatform, FakeResourcePlugin};
//! use std::sync::Arc;
//!
//! # fn main() -> cloudmgr_core::error::CoreResult<()> {
//! let config = ConfigManager::from_config(CoreConfig::default())?;
//! let platform = FakePlatform::new();
//! let plane = ControlPlane::builder(config)
//!     .driver(Arc::new(FakeDriver::new(platform.clone())))?
//!     .resource_type(Arc::new(FakeResourcePlugin::new("Fake.Server", platform)))?
//!     .build()?;
//! assert_eq!(plane.status().resource_types, vec!["Fake.Server".to_string()]);
//! # Ok(())
//! # }
//! ```

use super::assembler::PipelineAssembler;
use super::container_manager::ContainerManager;
use super::dispatcher::OperationDispatcher;
use super::executor::{TaskExecutor, WorkerPoolExecutor};
use super::pipeline::RetryPolicy;
use super::services::CoreServices;
use crate::auth::{AllowAllAuthorizer, Authorizer};
use crate::config::{ConfigManager, CoreConfig};
use crate::discovery::ReconciliationEngine;
use crate::error::{CoreError, CoreResult};
use crate::events::EventPublisher;
use crate::graph::ResourceGraph;
use crate::persistence::{MemoryGateway, PersistenceGateway};
use crate::plugin::{ContainerDriver, ResourcePlugin};
use crate::registry::{
    DriverRegistry, DriverRegistryBuilder, ResourceTypeRegistry, ResourceTypeRegistryBuilder,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Fully wired control plane
pub struct ControlPlane {
    config: Arc<ConfigManager>,
    services: CoreServices,
    registry: Arc<ResourceTypeRegistry>,
    drivers: Arc<DriverRegistry>,
    executor: Arc<WorkerPoolExecutor>,
    dispatcher: Arc<OperationDispatcher>,
    containers: Arc<ContainerManager>,
    reconciliation: ReconciliationEngine,
}

/// Snapshot of the running control plane
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlPlaneStatus {
    pub environment: String,
    pub resource_types: Vec<String>,
    pub container_types: Vec<String>,
    pub open_sessions: usize,
    pub active_tasks: usize,
    pub events_published: u64,
}

impl ControlPlane {
    pub fn builder(config: Arc<ConfigManager>) -> ControlPlaneBuilder {
        ControlPlaneBuilder {
            config,
            gateway: None,
            authorizer: None,
            resource_types: ResourceTypeRegistry::builder(),
            drivers: DriverRegistry::builder(),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        self.config.config()
    }

    pub fn services(&self) -> &CoreServices {
        &self.services
    }

    pub fn dispatcher(&self) -> &Arc<OperationDispatcher> {
        &self.dispatcher
    }

    pub fn containers(&self) -> &Arc<ContainerManager> {
        &self.containers
    }

    pub fn reconciliation(&self) -> &ReconciliationEngine {
        &self.reconciliation
    }

    pub fn graph(&self) -> &ResourceGraph {
        &self.services.graph
    }

    pub fn events(&self) -> &EventPublisher {
        &self.services.events
    }

    pub fn executor(&self) -> &Arc<WorkerPoolExecutor> {
        &self.executor
    }

    pub fn registry(&self) -> &Arc<ResourceTypeRegistry> {
        &self.registry
    }

    pub fn status(&self) -> ControlPlaneStatus {
        ControlPlaneStatus {
            environment: self.config.environment().to_string(),
            resource_types: self
                .registry
                .resource_types()
                .into_iter()
                .map(str::to_string)
                .collect(),
            container_types: self
                .drivers
                .container_types()
                .into_iter()
                .map(str::to_string)
                .collect(),
            open_sessions: self.services.sessions.open_count(),
            active_tasks: self.executor.active_tasks(),
            events_published: self.services.events.stats().published,
        }
    }
}

pub struct ControlPlaneBuilder {
    config: Arc<ConfigManager>,
    gateway: Option<Arc<dyn PersistenceGateway>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    resource_types: ResourceTypeRegistryBuilder,
    drivers: DriverRegistryBuilder,
}

impl ControlPlaneBuilder {
    /// Persistence backend; defaults to [`MemoryGateway`]
    pub fn gateway(mut self, gateway: Arc<dyn PersistenceGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Authorization backend; defaults to [`AllowAllAuthorizer`]
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn resource_type(mut self, plugin: Arc<dyn ResourcePlugin>) -> CoreResult<Self> {
        self.resource_types = self.resource_types.register(plugin)?;
        Ok(self)
    }

    pub fn driver(mut self, driver: Arc<dyn ContainerDriver>) -> CoreResult<Self> {
        self.drivers = self.drivers.register(driver)?;
        Ok(self)
    }

    /// Connect to PostgreSQL with the configured database settings, run the embedded
    /// migrations and build on top of that gateway
    #[cfg(feature = "postgres")]
    pub async fn connect(self) -> CoreResult<ControlPlane> {
        let gateway = crate::persistence::PgGateway::connect(&self.config.config().database).await?;
        gateway.migrate().await?;
        info!("BOOTSTRAP: PostgreSQL gateway connected and migrated");
        self.gateway(Arc::new(gateway)).build()
    }

    pub fn build(self) -> CoreResult<ControlPlane> {
        let config = self.config.config();
        let registry = Arc::new(self.resource_types.build());
        let drivers = Arc::new(self.drivers.build());

        for resource_type in registry.resource_types() {
            let plugin = registry.get(resource_type)?;
            drivers.get(plugin.container_type()).map_err(|_| {
                CoreError::Configuration(format!(
                    "{resource_type} needs a driver for container type {}",
                    plugin.container_type()
                ))
            })?;
        }

        let gateway = self
            .gateway
            .unwrap_or_else(|| Arc::new(MemoryGateway::new()));
        let authorizer = self
            .authorizer
            .unwrap_or_else(|| Arc::new(AllowAllAuthorizer));

        let services = CoreServices::new(config, gateway, drivers.clone());
        let executor = Arc::new(WorkerPoolExecutor::new(&config.executor));
        let assembler = Arc::new(PipelineAssembler::new(
            services.clone(),
            registry.clone(),
            RetryPolicy::from_config(&config.executor),
        ));
        let dispatcher = Arc::new(OperationDispatcher::new(
            services.clone(),
            registry.clone(),
            assembler.clone(),
            executor.clone() as Arc<dyn TaskExecutor>,
            authorizer.clone(),
        ));
        let containers = Arc::new(ContainerManager::new(
            services.clone(),
            drivers.clone(),
            assembler,
            authorizer.clone(),
        ));
        let reconciliation = ReconciliationEngine::new(
            services.clone(),
            registry.clone(),
            executor.clone() as Arc<dyn TaskExecutor>,
            authorizer,
            config.reconciliation.clone(),
        );

        info!(
            environment = self.config.environment(),
            resource_types = registry.len(),
            workers = config.executor.workers,
            "BOOTSTRAP: control plane ready"
        );

        Ok(ControlPlane {
            config: self.config,
            services,
            registry,
            drivers,
            executor,
            dispatcher,
            containers,
            reconciliation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FakeDriver, FakePlatform, FakeResourcePlugin};

    fn config() -> Arc<ConfigManager> {
        ConfigManager::from_config(CoreConfig::default()).unwrap()
    }

    #[test]
    fn test_build_with_defaults() {
        let platform = FakePlatform::new();
        let plane = ControlPlane::builder(config())
            .driver(Arc::new(FakeDriver::new(platform.clone())))
            .unwrap()
            .resource_type(Arc::new(FakeResourcePlugin::new("Fake.Server", platform)))
            .unwrap()
            .build()
            .unwrap();

        let status = plane.status();
        assert_eq!(status.container_types, vec!["Fake".to_string()]);
        assert_eq!(status.open_sessions, 0);
        assert_eq!(status.active_tasks, 0);
    }

    #[test]
    fn test_resource_type_without_driver_is_rejected() {
        let platform = FakePlatform::new();
        let err = ControlPlane::builder(config())
            .resource_type(Arc::new(FakeResourcePlugin::new("Fake.Server", platform)))
            .unwrap()
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[test]
    fn test_duplicate_resource_type_is_rejected() {
        let platform = FakePlatform::new();
        let builder = ControlPlane::builder(config())
            .resource_type(Arc::new(FakeResourcePlugin::new("Fake.Server", platform.clone())))
            .unwrap();
        assert!(builder
            .resource_type(Arc::new(FakeResourcePlugin::new("Fake.Server", platform)))
            .is_err());
    }
}
