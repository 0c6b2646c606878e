use super::{
    actions::{ErrorStateLoggingAction, PublishTransitionEventAction, StateAction},
    errors::{StateMachineError, StateMachineResult},
    events::ContainerEvent,
    guards::{ContainerEmptyGuard, StateGuard},
    states::ContainerState,
};
use crate::cache::EntityCache;
use crate::constants::{self, events, status_groups};
use crate::error::CoreResult;
use crate::events::{EventPublisher, TransitionPayload};
use crate::models::{Container, ContainerUpdate, EntityKey};
use crate::persistence::PersistenceGateway;
use std::sync::Arc;

/// Lifecycle manager for containers. Same write discipline as
/// [`ResourceStateMachine`](super::ResourceStateMachine).
#[derive(Clone)]
pub struct ContainerStateMachine {
    gateway: Arc<dyn PersistenceGateway>,
    cache: Arc<EntityCache<Container>>,
    event_publisher: EventPublisher,
}

impl ContainerStateMachine {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        cache: Arc<EntityCache<Container>>,
        event_publisher: EventPublisher,
    ) -> Self {
        Self {
            gateway,
            cache,
            event_publisher,
        }
    }

    pub fn allowed_from(event: &ContainerEvent) -> Vec<ContainerState> {
        use ContainerState::*;
        match event {
            ContainerEvent::Build => vec![Pending],
            ContainerEvent::Update | ContainerEvent::Disable => vec![Active, Error, Unknown],
            ContainerEvent::Synchronize => status_groups::SYNCHRONIZABLE_CONTAINER_STATES.to_vec(),
            ContainerEvent::Complete => vec![Building, Updating, Synchronize],
            ContainerEvent::Fail(_) | ContainerEvent::Expunge { force: true } => ContainerState::ALL
                .iter()
                .copied()
                .filter(|s| *s != Expunged)
                .collect(),
            ContainerEvent::Expunge { force: false } => constants::expungeable_container_states(),
            ContainerEvent::Expunged => vec![Expunging],
            ContainerEvent::Enable => vec![Disabled],
        }
    }

    pub fn target_state(event: &ContainerEvent) -> ContainerState {
        match event {
            ContainerEvent::Build => ContainerState::Building,
            ContainerEvent::Update => ContainerState::Updating,
            ContainerEvent::Synchronize => ContainerState::Synchronize,
            ContainerEvent::Complete | ContainerEvent::Enable => ContainerState::Active,
            ContainerEvent::Fail(_) => ContainerState::Error,
            ContainerEvent::Expunge { .. } => ContainerState::Expunging,
            ContainerEvent::Expunged => ContainerState::Expunged,
            ContainerEvent::Disable => ContainerState::Disabled,
        }
    }

    pub fn is_allowed(current: ContainerState, event: &ContainerEvent) -> bool {
        Self::allowed_from(event).contains(&current)
    }

    pub fn determine_target_state(
        container: &Container,
        event: &ContainerEvent,
    ) -> StateMachineResult<ContainerState> {
        if !Self::is_allowed(container.state, event) {
            return Err(StateMachineError::InvalidTransition {
                entity: "container",
                id: container.id,
                from: container.state.to_string(),
                event: event.event_type().to_string(),
            });
        }
        Ok(Self::target_state(event))
    }

    pub async fn get(&self, key: &EntityKey, use_cache: bool) -> CoreResult<Container> {
        if let (true, EntityKey::Id(id)) = (use_cache, key) {
            if let Some(container) = self.cache.get(*id) {
                return Ok(container);
            }
        }
        let container = self.gateway.get_container(key).await?;
        if use_cache {
            self.cache.insert(container.id, container.clone());
        }
        Ok(container)
    }

    pub async fn transition(&self, container_id: i64, event: ContainerEvent) -> CoreResult<Container> {
        let current = self.gateway.get_container(&EntityKey::Id(container_id)).await?;
        let target = Self::determine_target_state(&current, &event)?;
        self.check_guards(&current, &event).await?;

        self.cache.invalidate(container_id);
        let updated = match event.error_message() {
            Some(message) => {
                self.gateway
                    .set_container_state(container_id, target, Some(message.to_string()))
                    .await?
            }
            None => {
                self.gateway
                    .transition_container_state(container_id, &Self::allowed_from(&event), target)
                    .await?
            }
        };

        tracing::debug!(
            container_id,
            from = %current.state,
            to = %target,
            event = event.event_type(),
            "Container transition"
        );
        self.execute_actions(&updated, Some(current.state), event.event_type())
            .await?;
        Ok(updated)
    }

    pub async fn update_state(
        &self,
        container_id: i64,
        state: ContainerState,
        last_error: Option<String>,
    ) -> CoreResult<Container> {
        self.cache.invalidate(container_id);
        let updated = self
            .gateway
            .set_container_state(container_id, state, last_error)
            .await?;
        self.execute_actions(&updated, None, "update_state").await?;
        Ok(updated)
    }

    pub async fn update_fields(
        &self,
        container_id: i64,
        update: ContainerUpdate,
    ) -> CoreResult<Container> {
        self.cache.invalidate(container_id);
        Ok(self.gateway.update_container(container_id, update).await?)
    }

    /// Remove the row of a container in `EXPUNGING`
    pub async fn remove(&self, container_id: i64) -> CoreResult<()> {
        let current = self.gateway.get_container(&EntityKey::Id(container_id)).await?;
        Self::determine_target_state(&current, &ContainerEvent::Expunged)?;

        self.cache.invalidate(container_id);
        self.gateway.remove_container(container_id).await?;

        let payload = TransitionPayload::new(
            current.id,
            current.uuid,
            &current.objid,
            ContainerState::Expunged,
        )
        .with_from(current.state)
        .with_event(ContainerEvent::Expunged.event_type());
        if let Err(err) = self
            .event_publisher
            .publish(events::CONTAINER_EXPUNGED, payload.to_value())
            .await
        {
            tracing::warn!(container_id, error = %err, "Failed to publish expunge event");
        }
        Ok(())
    }

    async fn check_guards(&self, container: &Container, event: &ContainerEvent) -> StateMachineResult<()> {
        if let ContainerEvent::Expunge { force: false } = event {
            let guard = ContainerEmptyGuard;
            guard
                .check(container, self.gateway.as_ref())
                .await
                .map_err(|source| StateMachineError::GuardFailed {
                    entity: "container",
                    id: container.id,
                    source,
                })?;
        }
        Ok(())
    }

    async fn execute_actions(
        &self,
        container: &Container,
        from_state: Option<ContainerState>,
        event: &str,
    ) -> StateMachineResult<()> {
        let actions: Vec<Box<dyn StateAction<Container>>> = vec![
            Box::new(PublishTransitionEventAction::new(
                self.event_publisher.clone(),
            )),
            Box::new(ErrorStateLoggingAction),
        ];

        for action in actions {
            action
                .execute(
                    container,
                    from_state.map(|s| s.to_string()),
                    container.state.to_string(),
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
    use crate::models::NewContainer;
    use crate::persistence::MemoryGateway;
    use serde_json::json;

    async fn setup() -> (ContainerStateMachine, Container) {
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
        let machine = ContainerStateMachine::new(
            gateway,
            Arc::new(EntityCache::disabled()),
            EventPublisher::default(),
        );
        (machine, container)
    }

    #[test]
    fn test_synchronize_gate() {
        use ContainerState::*;
        assert!(ContainerStateMachine::is_allowed(Active, &ContainerEvent::Synchronize));
        assert!(ContainerStateMachine::is_allowed(Error, &ContainerEvent::Synchronize));
        assert!(!ContainerStateMachine::is_allowed(
            Synchronize,
            &ContainerEvent::Synchronize
        ));
        assert!(!ContainerStateMachine::is_allowed(Disabled, &ContainerEvent::Synchronize));
    }

    #[tokio::test]
    async fn test_build_and_expunge_empty_container() {
        let (machine, container) = setup().await;
        machine
            .transition(container.id, ContainerEvent::Build)
            .await
            .unwrap();
        let active = machine
            .transition(container.id, ContainerEvent::Complete)
            .await
            .unwrap();
        assert_eq!(active.state, ContainerState::Active);

        machine
            .transition(container.id, ContainerEvent::Expunge { force: false })
            .await
            .unwrap();
        machine.remove(container.id).await.unwrap();
        assert!(machine
            .get(&EntityKey::Id(container.id), false)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_disable_and_enable() {
        let (machine, container) = setup().await;
        machine
            .update_state(container.id, ContainerState::Active, None)
            .await
            .unwrap();
        let disabled = machine
            .transition(container.id, ContainerEvent::Disable)
            .await
            .unwrap();
        assert_eq!(disabled.state, ContainerState::Disabled);
        assert!(machine
            .transition(container.id, ContainerEvent::Update)
            .await
            .unwrap_err()
            .is_conflict());
        let enabled = machine
            .transition(container.id, ContainerEvent::Enable)
            .await
            .unwrap();
        assert_eq!(enabled.state, ContainerState::Active);
    }
}
