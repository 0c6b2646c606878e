use super::errors::{ActionError, ActionResult};
use crate::constants::events;
use crate::events::{EventPublisher, TransitionPayload};
use crate::models::{Container, Resource};
use async_trait::async_trait;

/// Trait for implementing state transition actions
#[async_trait]
pub trait StateAction<T>: Send + Sync {
    /// Execute the action once the new state has been persisted
    async fn execute(
        &self,
        entity: &T,
        from_state: Option<String>,
        to_state: String,
        event: &str,
    ) -> ActionResult<()>;

    /// Get a description of this action for logging
    fn description(&self) -> &'static str;
}

/// Action to publish lifecycle events when state transitions occur
pub struct PublishTransitionEventAction {
    event_publisher: EventPublisher,
}

impl PublishTransitionEventAction {
    pub fn new(event_publisher: EventPublisher) -> Self {
        Self { event_publisher }
    }

    async fn publish(&self, event_name: &str, payload: TransitionPayload) -> ActionResult<()> {
        self.event_publisher
            .publish(event_name, payload.to_value())
            .await
            .map_err(|_| ActionError::EventPublishFailed {
                event_name: event_name.to_string(),
            })
    }
}

fn non_empty(last_error: &str) -> Option<String> {
    (!last_error.is_empty()).then(|| last_error.to_string())
}

#[async_trait]
impl StateAction<Resource> for PublishTransitionEventAction {
    async fn execute(
        &self,
        resource: &Resource,
        from_state: Option<String>,
        to_state: String,
        event: &str,
    ) -> ActionResult<()> {
        let mut payload = TransitionPayload::new(resource.id, resource.uuid, &resource.objid, to_state)
            .with_event(event)
            .with_last_error(non_empty(&resource.last_error));
        if let Some(from) = from_state {
            payload = payload.with_from(from);
        }
        self.publish(events::RESOURCE_STATE_CHANGED, payload).await
    }

    fn description(&self) -> &'static str {
        "Publish lifecycle event for resource transition"
    }
}

#[async_trait]
impl StateAction<Container> for PublishTransitionEventAction {
    async fn execute(
        &self,
        container: &Container,
        from_state: Option<String>,
        to_state: String,
        event: &str,
    ) -> ActionResult<()> {
        let mut payload =
            TransitionPayload::new(container.id, container.uuid, &container.objid, to_state)
                .with_event(event)
                .with_last_error(non_empty(&container.last_error));
        if let Some(from) = from_state {
            payload = payload.with_from(from);
        }
        self.publish(events::CONTAINER_STATE_CHANGED, payload).await
    }

    fn description(&self) -> &'static str {
        "Publish lifecycle event for container transition"
    }
}

/// Action to record transitions into `ERROR` at warn level
pub struct ErrorStateLoggingAction;

#[async_trait]
impl StateAction<Resource> for ErrorStateLoggingAction {
    async fn execute(
        &self,
        resource: &Resource,
        from_state: Option<String>,
        to_state: String,
        event: &str,
    ) -> ActionResult<()> {
        if to_state == "ERROR" {
            tracing::warn!(
                resource_id = resource.id,
                resource_type = %resource.resource_type,
                from_state = from_state.as_deref().unwrap_or("-"),
                event = event,
                last_error = %resource.last_error,
                "Resource moved to ERROR"
            );
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Log resource failures"
    }
}

#[async_trait]
impl StateAction<Container> for ErrorStateLoggingAction {
    async fn execute(
        &self,
        container: &Container,
        from_state: Option<String>,
        to_state: String,
        event: &str,
    ) -> ActionResult<()> {
        if to_state == "ERROR" {
            tracing::warn!(
                container_id = container.id,
                container_type = %container.container_type,
                from_state = from_state.as_deref().unwrap_or("-"),
                event = event,
                last_error = %container.last_error,
                "Container moved to ERROR"
            );
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "Log container failures"
    }
}
