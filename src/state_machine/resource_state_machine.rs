use super::{
    actions::{ErrorStateLoggingAction, PublishTransitionEventAction, StateAction},
    errors::{StateMachineError, StateMachineResult},
    events::ResourceEvent,
    guards::{ContainerUsableGuard, NoChildrenGuard, StateGuard},
    states::ResourceState,
};
use crate::cache::EntityCache;
use crate::constants::{self, events, status_groups};
use crate::error::CoreResult;
use crate::events::{EventPublisher, TransitionPayload};
use crate::models::{EntityKey, Resource, ResourceUpdate};
use crate::persistence::PersistenceGateway;
use std::sync::Arc;

/// Lifecycle manager for resources.
///
/// Every write to a resource row goes through this type so the cache entry is
/// invalidated before the gateway is touched and a state-change event follows every
/// state write. Gated transitions are persisted with a compare-and-swap on the current
/// state, which makes "check the state, then take the lock" a single atomic step.
#[derive(Clone)]
pub struct ResourceStateMachine {
    gateway: Arc<dyn PersistenceGateway>,
    cache: Arc<EntityCache<Resource>>,
    event_publisher: EventPublisher,
}

impl ResourceStateMachine {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        cache: Arc<EntityCache<Resource>>,
        event_publisher: EventPublisher,
    ) -> Self {
        Self {
            gateway,
            cache,
            event_publisher,
        }
    }

    /// States from which `event` may fire
    pub fn allowed_from(event: &ResourceEvent) -> Vec<ResourceState> {
        use ResourceState::*;
        match event {
            ResourceEvent::Build => vec![Pending],
            ResourceEvent::Update | ResourceEvent::Delete | ResourceEvent::Disable => {
                status_groups::OPERABLE_STATES.to_vec()
            }
            ResourceEvent::Complete => vec![Building, Updating],
            ResourceEvent::Fail(_) => constants::non_terminal_resource_states(),
            ResourceEvent::SoftDelete => vec![Deleting],
            ResourceEvent::Expunge { force: false } => status_groups::EXPUNGEABLE_STATES.to_vec(),
            ResourceEvent::Expunge { force: true } => constants::non_terminal_resource_states(),
            ResourceEvent::Expunged => vec![Expunging],
            ResourceEvent::Enable => vec![Disabled],
        }
    }

    /// State an event leads to
    pub fn target_state(event: &ResourceEvent) -> ResourceState {
        match event {
            ResourceEvent::Build => ResourceState::Building,
            ResourceEvent::Update => ResourceState::Updating,
            ResourceEvent::Complete | ResourceEvent::Enable => ResourceState::Active,
            ResourceEvent::Fail(_) => ResourceState::Error,
            ResourceEvent::Delete => ResourceState::Deleting,
            ResourceEvent::SoftDelete => ResourceState::Deleted,
            ResourceEvent::Expunge { .. } => ResourceState::Expunging,
            ResourceEvent::Expunged => ResourceState::Expunged,
            ResourceEvent::Disable => ResourceState::Disabled,
        }
    }

    pub fn is_allowed(current: ResourceState, event: &ResourceEvent) -> bool {
        Self::allowed_from(event).contains(&current)
    }

    /// Determine the target state based on current state and event
    pub fn determine_target_state(
        resource: &Resource,
        event: &ResourceEvent,
    ) -> StateMachineResult<ResourceState> {
        if !Self::is_allowed(resource.state, event) {
            return Err(StateMachineError::InvalidTransition {
                entity: "resource",
                id: resource.id,
                from: resource.state.to_string(),
                event: event.event_type().to_string(),
            });
        }
        Ok(Self::target_state(event))
    }

    /// Read a resource. `use_cache = false` always goes to the gateway.
    pub async fn get(&self, key: &EntityKey, use_cache: bool) -> CoreResult<Resource> {
        if let (true, EntityKey::Id(id)) = (use_cache, key) {
            if let Some(resource) = self.cache.get(*id) {
                return Ok(resource);
            }
        }
        let resource = self.gateway.get_resource(key).await?;
        if use_cache {
            self.cache.insert(resource.id, resource.clone());
        }
        Ok(resource)
    }

    /// Read-only gate check used to reject an operation before anything is written
    pub async fn ensure_allowed(&self, resource: &Resource, event: &ResourceEvent) -> CoreResult<()> {
        Self::determine_target_state(resource, event)?;
        self.check_guards(resource, event, true).await?;
        Ok(())
    }

    /// Fire a gated transition
    pub async fn transition(&self, resource_id: i64, event: ResourceEvent) -> CoreResult<Resource> {
        self.fire(resource_id, event, true).await
    }

    /// Fire a transition for an operation that removes the children itself. The state
    /// gate still applies; only the no-children guard is skipped.
    pub async fn transition_cascading(
        &self,
        resource_id: i64,
        event: ResourceEvent,
    ) -> CoreResult<Resource> {
        self.fire(resource_id, event, false).await
    }

    async fn fire(
        &self,
        resource_id: i64,
        event: ResourceEvent,
        guard_children: bool,
    ) -> CoreResult<Resource> {
        let current = self.gateway.get_resource(&EntityKey::Id(resource_id)).await?;
        let target = Self::determine_target_state(&current, &event)?;
        self.check_guards(&current, &event, guard_children).await?;

        self.cache.invalidate(resource_id);
        let updated = match event.error_message() {
            Some(message) => {
                self.gateway
                    .set_resource_state(resource_id, target, Some(message.to_string()))
                    .await?
            }
            None => {
                self.gateway
                    .transition_resource_state(resource_id, &Self::allowed_from(&event), target)
                    .await?
            }
        };

        tracing::debug!(
            resource_id,
            from = %current.state,
            to = %target,
            event = event.event_type(),
            "Resource transition"
        );
        self.execute_actions(&updated, Some(current.state), event.event_type())
            .await?;
        Ok(updated)
    }

    /// Unconditional state write
    pub async fn update_state(
        &self,
        resource_id: i64,
        state: ResourceState,
        last_error: Option<String>,
    ) -> CoreResult<Resource> {
        self.cache.invalidate(resource_id);
        let updated = self
            .gateway
            .set_resource_state(resource_id, state, last_error)
            .await?;
        self.execute_actions(&updated, None, "update_state").await?;
        Ok(updated)
    }

    /// Write the mutable non-state fields
    pub async fn update_fields(&self, resource_id: i64, update: ResourceUpdate) -> CoreResult<Resource> {
        self.cache.invalidate(resource_id);
        Ok(self.gateway.update_resource(resource_id, update).await?)
    }

    /// Finish a soft delete: `DELETING → DELETED`, `active = false`, `expiry_date` set
    pub async fn soft_delete(&self, resource_id: i64) -> CoreResult<Resource> {
        let current = self.gateway.get_resource(&EntityKey::Id(resource_id)).await?;
        Self::determine_target_state(&current, &ResourceEvent::SoftDelete)?;

        self.cache.invalidate(resource_id);
        let updated = self.gateway.soft_delete_resource(resource_id).await?;
        self.execute_actions(
            &updated,
            Some(current.state),
            ResourceEvent::SoftDelete.event_type(),
        )
        .await?;
        Ok(updated)
    }

    /// Finish an expunge by removing the row. Links touching the resource must already
    /// be gone.
    pub async fn remove(&self, resource_id: i64) -> CoreResult<()> {
        let current = self.gateway.get_resource(&EntityKey::Id(resource_id)).await?;
        Self::determine_target_state(&current, &ResourceEvent::Expunged)?;

        self.cache.invalidate(resource_id);
        self.gateway.remove_resource(resource_id).await?;

        let payload = TransitionPayload::new(
            current.id,
            current.uuid,
            &current.objid,
            ResourceState::Expunged,
        )
        .with_from(current.state)
        .with_event(ResourceEvent::Expunged.event_type());
        if let Err(err) = self
            .event_publisher
            .publish(events::RESOURCE_EXPUNGED, payload.to_value())
            .await
        {
            tracing::warn!(resource_id, error = %err, "Failed to publish expunge event");
        }
        Ok(())
    }

    /// Check guard conditions for the transition
    async fn check_guards(
        &self,
        resource: &Resource,
        event: &ResourceEvent,
        guard_children: bool,
    ) -> StateMachineResult<()> {
        let guards: Vec<Box<dyn StateGuard<Resource>>> = match event {
            ResourceEvent::Build | ResourceEvent::Update => vec![Box::new(ContainerUsableGuard)],
            ResourceEvent::Delete | ResourceEvent::Expunge { force: false } if guard_children => {
                vec![Box::new(NoChildrenGuard)]
            }
            _ => Vec::new(),
        };

        for guard in guards {
            guard
                .check(resource, self.gateway.as_ref())
                .await
                .map_err(|source| {
                    tracing::debug!(
                        resource_id = resource.id,
                        guard = guard.description(),
                        "Guard rejected transition"
                    );
                    StateMachineError::GuardFailed {
                        entity: "resource",
                        id: resource.id,
                        source,
                    }
                })?;
        }
        Ok(())
    }

    /// Execute actions after successful transition
    async fn execute_actions(
        &self,
        resource: &Resource,
        from_state: Option<ResourceState>,
        event: &str,
    ) -> StateMachineResult<()> {
        let actions: Vec<Box<dyn StateAction<Resource>>> = vec![
            Box::new(PublishTransitionEventAction::new(
                self.event_publisher.clone(),
            )),
            Box::new(ErrorStateLoggingAction),
        ];

        for action in actions {
            action
                .execute(
                    resource,
                    from_state.map(|s| s.to_string()),
                    resource.state.to_string(),
                    event,
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerUpdate, NewContainer, NewResource};
    use crate::persistence::MemoryGateway;
    use crate::state_machine::ContainerState;
    use serde_json::json;
    use std::time::Duration;

    async fn setup() -> (ResourceStateMachine, Arc<MemoryGateway>, Resource) {
        let gateway = Arc::new(MemoryGateway::new());
        let container = gateway
            .add_container(NewContainer {
                objid: "c0".to_string(),
                name: "region".to_string(),
                desc: String::new(),
                category: "Private".to_string(),
                container_type: "Fake".to_string(),
                implementation_class: "fake::Container".to_string(),
                connection: json!({}),
            })
            .await
            .unwrap();
        gateway
            .set_container_state(container.id, ContainerState::Active, None)
            .await
            .unwrap();
        gateway
            .update_container(
                container.id,
                ContainerUpdate {
                    active: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let resource = gateway
            .add_resource(NewResource {
                objid: "c0//r".to_string(),
                name: "r".to_string(),
                desc: String::new(),
                resource_type: "Fake.Server".to_string(),
                implementation_class: "fake::Server".to_string(),
                container_id: container.id,
                parent_id: None,
                ext_id: String::new(),
                state: ResourceState::Pending,
                active: false,
                attribute: json!({}),
            })
            .await
            .unwrap();

        let machine = ResourceStateMachine::new(
            gateway.clone(),
            Arc::new(EntityCache::new(Duration::from_secs(60))),
            EventPublisher::default(),
        );
        (machine, gateway, resource)
    }

    #[test]
    fn test_transition_table() {
        use ResourceState::*;
        assert!(ResourceStateMachine::is_allowed(Pending, &ResourceEvent::Build));
        assert!(!ResourceStateMachine::is_allowed(Active, &ResourceEvent::Build));
        for state in [Active, Error, Unknown] {
            assert!(ResourceStateMachine::is_allowed(state, &ResourceEvent::Update));
        }
        for state in [Pending, Building, Updating, Deleting, Expunging, Disabled] {
            assert!(!ResourceStateMachine::is_allowed(state, &ResourceEvent::Update));
        }
        assert!(ResourceStateMachine::is_allowed(
            Deleted,
            &ResourceEvent::Expunge { force: false }
        ));
        assert!(!ResourceStateMachine::is_allowed(
            Building,
            &ResourceEvent::Expunge { force: false }
        ));
        assert!(ResourceStateMachine::is_allowed(
            Building,
            &ResourceEvent::Expunge { force: true }
        ));
        assert!(!ResourceStateMachine::is_allowed(
            Expunged,
            &ResourceEvent::Expunge { force: true }
        ));
    }

    #[tokio::test]
    async fn test_build_complete_cycle_publishes_events() {
        let (machine, _gateway, resource) = setup().await;
        let mut rx = machine.event_publisher.subscribe();

        let building = machine
            .transition(resource.id, ResourceEvent::Build)
            .await
            .unwrap();
        assert_eq!(building.state, ResourceState::Building);

        let active = machine
            .transition(resource.id, ResourceEvent::Complete)
            .await
            .unwrap();
        assert_eq!(active.state, ResourceState::Active);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.name, events::RESOURCE_STATE_CHANGED);
        assert_eq!(first.context["from"], "PENDING");
        assert_eq!(first.context["to"], "BUILDING");
    }

    #[tokio::test]
    async fn test_second_build_is_a_conflict() {
        let (machine, _gateway, resource) = setup().await;
        machine
            .transition(resource.id, ResourceEvent::Build)
            .await
            .unwrap();
        let err = machine
            .transition(resource.id, ResourceEvent::Build)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_fail_records_last_error() {
        let (machine, _gateway, resource) = setup().await;
        machine
            .transition(resource.id, ResourceEvent::Build)
            .await
            .unwrap();
        let failed = machine
            .transition(resource.id, ResourceEvent::fail_with_error("quota exceeded"))
            .await
            .unwrap();
        assert_eq!(failed.state, ResourceState::Error);
        assert_eq!(failed.last_error, "quota exceeded");
    }

    #[tokio::test]
    async fn test_update_state_invalidates_cache() {
        let (machine, _gateway, resource) = setup().await;
        let key = EntityKey::Id(resource.id);
        assert_eq!(
            machine.get(&key, true).await.unwrap().state,
            ResourceState::Pending
        );

        machine
            .update_state(resource.id, ResourceState::Unknown, None)
            .await
            .unwrap();
        assert_eq!(
            machine.get(&key, true).await.unwrap().state,
            ResourceState::Unknown
        );
    }

    #[tokio::test]
    async fn test_cascading_delete_skips_only_the_children_guard() {
        let (machine, gateway, parent) = setup().await;
        machine
            .update_state(parent.id, ResourceState::Active, None)
            .await
            .unwrap();
        gateway
            .add_resource(NewResource {
                objid: "c0//r//child".to_string(),
                name: "child".to_string(),
                desc: String::new(),
                resource_type: "Fake.Server".to_string(),
                implementation_class: "fake::Server".to_string(),
                container_id: parent.container_id,
                parent_id: Some(parent.id),
                ext_id: String::new(),
                state: ResourceState::Active,
                active: true,
                attribute: json!({}),
            })
            .await
            .unwrap();

        let err = machine
            .transition(parent.id, ResourceEvent::Delete)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let deleting = machine
            .transition_cascading(parent.id, ResourceEvent::Delete)
            .await
            .unwrap();
        assert_eq!(deleting.state, ResourceState::Deleting);

        // the state gate still holds
        assert!(machine
            .transition_cascading(parent.id, ResourceEvent::Delete)
            .await
            .unwrap_err()
            .is_conflict());
    }

    #[tokio::test]
    async fn test_soft_delete_then_remove() {
        let (machine, gateway, resource) = setup().await;
        machine
            .update_state(resource.id, ResourceState::Active, None)
            .await
            .unwrap();
        machine
            .transition(resource.id, ResourceEvent::Delete)
            .await
            .unwrap();
        let deleted = machine.soft_delete(resource.id).await.unwrap();
        assert_eq!(deleted.state, ResourceState::Deleted);
        assert!(!deleted.active);
        assert!(deleted.expiry_date.is_some());

        // removing straight from DELETED skips the EXPUNGING lock
        assert!(machine.remove(resource.id).await.unwrap_err().is_conflict());

        machine
            .transition(resource.id, ResourceEvent::Expunge { force: false })
            .await
            .unwrap();
        machine.remove(resource.id).await.unwrap();
        assert!(gateway
            .get_resource(&EntityKey::Id(resource.id))
            .await
            .is_err());
    }
}
