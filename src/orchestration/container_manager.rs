//! # Container Manager
//!
//! Lifecycle of containers (connections to remote platforms):
//!
//! ```text
//! PENDING ──▶ BUILDING ──(driver connects, ping ok)──▶ ACTIVE
//!                 └──────────(any failure)───────────▶ ERROR
//! ACTIVE/ERROR/UNKNOWN/DISABLED ──▶ EXPUNGING ──▶ row removed
//! ```
//!
//! Container sessions are closed whenever the connection may have changed: on update,
//! disable and expunge.

use super::assembler::PipelineAssembler;
use super::services::CoreServices;
use crate::auth::{operations, Authorizer};
use crate::constants::objtype;
use crate::error::{CoreError, CoreResult};
use crate::logging::log_container_operation;
use crate::models::{
    objid, Container, ContainerFilter, ContainerUpdate, EntityKey, NewContainer, ResourceFilter,
};
use crate::persistence::{PaginatedResult, Pagination};
use crate::registry::DriverRegistry;
use crate::state_machine::{ContainerEvent, ContainerState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Parameters of a new container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRequest {
    pub name: String,
    #[serde(default)]
    pub desc: String,
    pub category: String,
    pub container_type: String,
    pub implementation_class: String,
    #[serde(default)]
    pub connection: Value,
}

pub struct ContainerManager {
    services: CoreServices,
    drivers: Arc<DriverRegistry>,
    assembler: Arc<PipelineAssembler>,
    authorizer: Arc<dyn Authorizer>,
}

impl ContainerManager {
    pub fn new(
        services: CoreServices,
        drivers: Arc<DriverRegistry>,
        assembler: Arc<PipelineAssembler>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            services,
            drivers,
            assembler,
            authorizer,
        }
    }

    async fn authorize(&self, container: &Container, operation: &str) -> CoreResult<()> {
        self.authorizer
            .check_authorization(
                objtype::CONTAINER,
                &container.container_type,
                &container.objid,
                operation,
            )
            .await
    }

    /// Register a container and validate its connection
    #[instrument(skip(self, request), fields(container_type = %request.container_type, name = %request.name))]
    pub async fn add_container(&self, request: ContainerRequest) -> CoreResult<Container> {
        if request.name.trim().is_empty() {
            return Err(CoreError::Validation("container name must not be empty".to_string()));
        }
        let driver = self
            .drivers
            .resolve(&request.container_type, &request.implementation_class)?;

        let objid = objid::root();
        self.authorizer
            .check_authorization(
                objtype::CONTAINER,
                &request.container_type,
                &objid,
                operations::INSERT,
            )
            .await?;
        driver.validate_connection(&request.connection).await?;

        let container = self
            .services
            .gateway
            .add_container(NewContainer {
                objid,
                name: request.name.trim().to_string(),
                desc: request.desc,
                category: request.category,
                container_type: request.container_type,
                implementation_class: request.implementation_class,
                connection: request.connection,
            })
            .await?;
        log_container_operation(
            "add",
            Some(container.id),
            &container.container_type,
            container.state.as_str(),
            None,
        );

        self.services
            .containers
            .transition(container.id, ContainerEvent::Build)
            .await?;
        self.activate(container).await
    }

    /// Connect and ping, then `ACTIVE`; any failure lands the container in `ERROR`
    async fn activate(&self, container: Container) -> CoreResult<Container> {
        let outcome = async {
            let session = self.services.sessions.get_or_open(&container).await?;
            if !session.client().ping().await {
                return Err(CoreError::remote(
                    container.container_type.clone(),
                    format!("container {} did not answer ping", container.id),
                ));
            }
            self.services
                .containers
                .update_fields(
                    container.id,
                    ContainerUpdate {
                        active: Some(true),
                        ..Default::default()
                    },
                )
                .await?;
            self.services
                .containers
                .transition(container.id, ContainerEvent::Complete)
                .await
        }
        .await;

        match outcome {
            Ok(active) => {
                log_container_operation(
                    "activate",
                    Some(active.id),
                    &active.container_type,
                    active.state.as_str(),
                    None,
                );
                Ok(active)
            }
            Err(err) => {
                self.services.sessions.close(container.id).await;
                if let Err(record_err) = self
                    .services
                    .containers
                    .update_state(container.id, ContainerState::Error, Some(err.to_string()))
                    .await
                {
                    warn!(container_id = container.id, error = %record_err, "Failed to record container failure");
                }
                Err(err)
            }
        }
    }

    pub async fn get_container(&self, key: &EntityKey) -> CoreResult<Container> {
        let container = self.services.containers.get(key, true).await?;
        self.authorize(&container, operations::VIEW).await?;
        Ok(container)
    }

    pub async fn list_containers(
        &self,
        filter: &ContainerFilter,
        page: Pagination,
    ) -> CoreResult<PaginatedResult<Container>> {
        Ok(self.services.gateway.list_containers(filter, page).await?)
    }

    /// Update name, description or connection. A new connection is re-validated.
    #[instrument(skip(self, update))]
    pub async fn update_container(
        &self,
        key: &EntityKey,
        update: ContainerUpdate,
    ) -> CoreResult<Container> {
        let container = self.services.containers.get(key, false).await?;
        self.authorize(&container, operations::UPDATE).await?;
        if let Some(connection) = &update.connection {
            self.drivers
                .resolve(&container.container_type, &container.implementation_class)?
                .validate_connection(connection)
                .await?;
        }

        self.services
            .containers
            .transition(container.id, ContainerEvent::Update)
            .await?;
        let updated = match self.services.containers.update_fields(container.id, update).await {
            Ok(updated) => updated,
            Err(err) => {
                self.services
                    .containers
                    .transition(container.id, ContainerEvent::fail_with_error(err.to_string()))
                    .await?;
                return Err(err);
            }
        };
        self.services.sessions.close(container.id).await;
        self.activate(updated).await
    }

    /// Live state: `DISABLED` wins, otherwise a failed ping reports `ERROR`. Nothing is
    /// persisted.
    pub async fn container_state(&self, key: &EntityKey) -> CoreResult<ContainerState> {
        let container = self.services.containers.get(key, false).await?;
        self.authorize(&container, operations::VIEW).await?;
        if container.state == ContainerState::Disabled {
            return Ok(ContainerState::Disabled);
        }
        let reachable = match self.services.sessions.get_or_open(&container).await {
            Ok(session) => session.client().ping().await,
            Err(err) => {
                warn!(container_id = container.id, error = %err, "Container unreachable");
                false
            }
        };
        Ok(if reachable {
            container.state
        } else {
            ContainerState::Error
        })
    }

    pub async fn disable(&self, key: &EntityKey) -> CoreResult<Container> {
        let container = self.services.containers.get(key, false).await?;
        self.authorize(&container, operations::UPDATE).await?;
        let disabled = self
            .services
            .containers
            .transition(container.id, ContainerEvent::Disable)
            .await?;
        self.services.sessions.close(container.id).await;
        Ok(disabled)
    }

    pub async fn enable(&self, key: &EntityKey) -> CoreResult<Container> {
        let container = self.services.containers.get(key, false).await?;
        self.authorize(&container, operations::UPDATE).await?;
        self.services
            .containers
            .transition(container.id, ContainerEvent::Enable)
            .await
    }

    /// Remove the container. Without `force` it must own no resources (soft-deleted
    /// ones included); with `force` every resource is expunged first.
    #[instrument(skip(self))]
    pub async fn expunge_container(&self, key: &EntityKey, force: bool) -> CoreResult<()> {
        let container = self.services.containers.get(key, false).await?;
        self.authorize(&container, operations::DELETE).await?;

        self.services
            .containers
            .transition(container.id, ContainerEvent::Expunge { force })
            .await?;

        if force {
            if let Err(err) = self
                .assembler
                .expunge_container_resources(container.id)
                .await
            {
                self.services
                    .containers
                    .update_state(container.id, ContainerState::Error, Some(err.to_string()))
                    .await?;
                return Err(err);
            }
        }

        let remaining = self
            .services
            .gateway
            .count_resources(&ResourceFilter::by_container(container.id).including_deleted())
            .await?;
        if remaining > 0 {
            let err = CoreError::conflict(
                "container",
                container.id,
                format!("{remaining} resources were added during expunge"),
            );
            self.services
                .containers
                .update_state(container.id, ContainerState::Error, Some(err.to_string()))
                .await?;
            return Err(err);
        }

        self.services.sessions.close(container.id).await;
        self.services.containers.remove(container.id).await?;
        info!(container_id = container.id, "Container expunged");
        log_container_operation(
            "expunge",
            Some(container.id),
            &container.container_type,
            ContainerState::Expunged.as_str(),
            None,
        );
        Ok(())
    }
}
