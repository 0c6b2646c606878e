use super::session::SessionPool;
use crate::cache::EntityCache;
use crate::config::CoreConfig;
use crate::events::EventPublisher;
use crate::graph::ResourceGraph;
use crate::persistence::PersistenceGateway;
use crate::registry::DriverRegistry;
use crate::state_machine::{ContainerStateMachine, ResourceStateMachine};
use std::sync::Arc;

/// Shared handles every step, the dispatcher and the reconciliation engine work with.
/// Cloning is cheap.
#[derive(Clone)]
pub struct CoreServices {
    pub gateway: Arc<dyn PersistenceGateway>,
    pub resources: ResourceStateMachine,
    pub containers: ContainerStateMachine,
    pub sessions: Arc<SessionPool>,
    pub graph: ResourceGraph,
    pub events: EventPublisher,
}

impl CoreServices {
    pub fn new(
        config: &CoreConfig,
        gateway: Arc<dyn PersistenceGateway>,
        drivers: Arc<DriverRegistry>,
    ) -> Self {
        let events = EventPublisher::from_config(&config.events);
        Self {
            resources: ResourceStateMachine::new(
                gateway.clone(),
                Arc::new(EntityCache::from_config(&config.cache)),
                events.clone(),
            ),
            containers: ContainerStateMachine::new(
                gateway.clone(),
                Arc::new(EntityCache::from_config(&config.cache)),
                events.clone(),
            ),
            sessions: Arc::new(SessionPool::new(drivers)),
            graph: ResourceGraph::new(gateway.clone()),
            gateway,
            events,
        }
    }
}
