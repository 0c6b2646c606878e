use crate::error::CoreError;
use crate::persistence::GatewayError;
use thiserror::Error;

/// Errors raised while moving an entity through its lifecycle
#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("Invalid transition for {entity} {id}: {event} is not allowed from {from}")]
    InvalidTransition {
        entity: &'static str,
        id: i64,
        from: String,
        event: String,
    },

    #[error("Guard rejected transition for {entity} {id}: {source}")]
    GuardFailed {
        entity: &'static str,
        id: i64,
        #[source]
        source: GuardError,
    },

    #[error("Post-transition action failed: {0}")]
    Action(#[from] ActionError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] GatewayError),
}

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("{count} child resources still exist")]
    ChildrenPresent { count: u64 },

    #[error("container {container_id} is not usable (state {state}, active {active})")]
    ContainerUnusable {
        container_id: i64,
        state: String,
        active: bool,
    },

    #[error("{count} resources still belong to the container")]
    ContainerNotEmpty { count: u64 },

    #[error("Persistence error: {0}")]
    Persistence(#[from] GatewayError),
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Failed to publish event {event_name}")]
    EventPublishFailed { event_name: String },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
pub type GuardResult<T> = Result<T, GuardError>;
pub type ActionResult<T> = Result<T, ActionError>;

impl From<StateMachineError> for CoreError {
    fn from(err: StateMachineError) -> Self {
        match err {
            StateMachineError::InvalidTransition {
                entity,
                id,
                from,
                event,
            } => CoreError::conflict(entity, id, format!("cannot {event} from state {from}")),
            StateMachineError::GuardFailed {
                entity,
                id,
                source: GuardError::Persistence(gateway),
            } => {
                tracing::debug!(entity, id, "guard lookup failed");
                gateway.into()
            }
            StateMachineError::GuardFailed { entity, id, source } => {
                CoreError::conflict(entity, id, source.to_string())
            }
            StateMachineError::Action(action) => CoreError::Internal(action.to_string()),
            StateMachineError::Persistence(gateway) => gateway.into(),
        }
    }
}
