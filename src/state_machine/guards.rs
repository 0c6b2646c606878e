use super::errors::{GuardError, GuardResult};
use crate::models::{Container, EntityKey, Resource, ResourceFilter};
use crate::persistence::PersistenceGateway;
use async_trait::async_trait;

/// Trait for implementing state transition guards
#[async_trait]
pub trait StateGuard<T>: Send + Sync {
    /// Check if a transition is allowed
    async fn check(&self, entity: &T, gateway: &dyn PersistenceGateway) -> GuardResult<()>;

    /// Get a description of this guard for logging
    fn description(&self) -> &'static str;
}

/// A resource may not be deleted or expunged while it has children
pub struct NoChildrenGuard;

#[async_trait]
impl StateGuard<Resource> for NoChildrenGuard {
    async fn check(&self, resource: &Resource, gateway: &dyn PersistenceGateway) -> GuardResult<()> {
        let count = gateway
            .count_resources(&ResourceFilter::children_of(resource.id))
            .await?;
        if count > 0 {
            return Err(GuardError::ChildrenPresent { count });
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Resource must have no children"
    }
}

/// The owning container must be active and usable
pub struct ContainerUsableGuard;

#[async_trait]
impl StateGuard<Resource> for ContainerUsableGuard {
    async fn check(&self, resource: &Resource, gateway: &dyn PersistenceGateway) -> GuardResult<()> {
        let container = gateway
            .get_container(&EntityKey::Id(resource.container_id))
            .await?;
        if !container.is_usable() {
            return Err(GuardError::ContainerUnusable {
                container_id: container.id,
                state: container.state.to_string(),
                active: container.active,
            });
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Owning container must be usable"
    }
}

/// A container may not be expunged while it still owns resources
pub struct ContainerEmptyGuard;

#[async_trait]
impl StateGuard<Container> for ContainerEmptyGuard {
    async fn check(
        &self,
        container: &Container,
        gateway: &dyn PersistenceGateway,
    ) -> GuardResult<()> {
        let count = gateway
            .count_resources(&ResourceFilter::by_container(container.id).including_deleted())
            .await?;
        if count > 0 {
            return Err(GuardError::ContainerNotEmpty { count });
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Container must own no resources"
    }
}
