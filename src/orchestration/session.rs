//! # Container Sessions
//!
//! A [`ContainerSession`] bundles a container snapshot with the live platform client its
//! driver opened. Sessions are handed out by the [`SessionPool`] as `Arc`s and passed
//! explicitly into every plugin hook; nothing holds a connection implicitly.
//!
//! Sessions live until [`SessionPool::close`] is called, which the container manager
//! does whenever a container is reconfigured, disabled or expunged.

use crate::error::{CoreError, CoreResult};
use crate::models::Container;
use crate::plugin::PlatformClient;
use crate::registry::DriverRegistry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ContainerSession {
    container: Container,
    client: Arc<dyn PlatformClient>,
    opened_at: DateTime<Utc>,
}

impl std::fmt::Debug for ContainerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSession")
            .field("container_id", &self.container.id)
            .field("container_type", &self.container.container_type)
            .field("opened_at", &self.opened_at)
            .finish()
    }
}

impl ContainerSession {
    pub fn new(container: Container, client: Arc<dyn PlatformClient>) -> Self {
        Self {
            container,
            client,
            opened_at: Utc::now(),
        }
    }

    /// Container as it was when the session was opened
    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn client(&self) -> &Arc<dyn PlatformClient> {
        &self.client
    }

    /// Concrete client, for plugins written against a specific driver
    pub fn client_as<T: PlatformClient>(&self) -> Option<&T> {
        self.client.as_any().downcast_ref::<T>()
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }
}

/// Open sessions keyed by container id
pub struct SessionPool {
    drivers: Arc<DriverRegistry>,
    sessions: DashMap<i64, Arc<ContainerSession>>,
}

impl SessionPool {
    pub fn new(drivers: Arc<DriverRegistry>) -> Self {
        Self {
            drivers,
            sessions: DashMap::new(),
        }
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    /// Reuse the open session for the container or connect a new one
    pub async fn get_or_open(&self, container: &Container) -> CoreResult<Arc<ContainerSession>> {
        if let Some(session) = self.sessions.get(&container.id) {
            return Ok(session.clone());
        }

        let driver = self
            .drivers
            .resolve(&container.container_type, &container.implementation_class)?;
        let client = driver.connect(container).await.map_err(|err| {
            CoreError::remote(
                container.container_type.clone(),
                format!("connection to container {} failed: {err:#}", container.id),
            )
        })?;

        let session = Arc::new(ContainerSession::new(container.clone(), client));
        info!(
            container_id = container.id,
            container_type = %container.container_type,
            "Opened container session"
        );
        // A concurrent opener may have won; keep whichever session landed first
        Ok(self
            .sessions
            .entry(container.id)
            .or_insert(session)
            .clone())
    }

    pub fn get(&self, container_id: i64) -> Option<Arc<ContainerSession>> {
        self.sessions.get(&container_id).map(|entry| entry.clone())
    }

    /// Drop the session and close its client
    pub async fn close(&self, container_id: i64) -> bool {
        match self.sessions.remove(&container_id) {
            Some((_, session)) => {
                session.client.close().await;
                debug!(container_id, "Closed container session");
                true
            }
            None => false,
        }
    }

    pub fn open_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::ContainerState;
    use crate::test_helpers::{FakeClient, FakeDriver, FakePlatform};
    use serde_json::json;

    fn container(id: i64, container_type: &str) -> Container {
        Container {
            id,
            uuid: uuid::Uuid::new_v4(),
            objid: format!("c{id}"),
            name: format!("container-{id}"),
            desc: String::new(),
            category: "Private".to_string(),
            container_type: container_type.to_string(),
            implementation_class: FakeDriver::IMPLEMENTATION_CLASS.to_string(),
            connection: json!({}),
            state: ContainerState::Active,
            active: true,
            last_error: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            expiry_date: None,
        }
    }

    fn pool(platform: &Arc<FakePlatform>) -> SessionPool {
        let drivers = DriverRegistry::builder()
            .register(Arc::new(FakeDriver::new(platform.clone())))
            .unwrap()
            .build();
        SessionPool::new(Arc::new(drivers))
    }

    #[tokio::test]
    async fn test_sessions_are_reused_until_closed() {
        let platform = FakePlatform::new();
        let pool = pool(&platform);
        let container = container(1, "Fake");

        let first = pool.get_or_open(&container).await.unwrap();
        let second = pool.get_or_open(&container).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(platform.connect_count(), 1);

        assert!(pool.close(1).await);
        assert!(!pool.close(1).await);
        pool.get_or_open(&container).await.unwrap();
        assert_eq!(platform.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_client_downcast() {
        let platform = FakePlatform::new();
        let pool = pool(&platform);
        let session = pool.get_or_open(&container(1, "Fake")).await.unwrap();
        assert!(session.client_as::<FakeClient>().is_some());
    }

    #[tokio::test]
    async fn test_unreachable_platform_is_a_remote_failure() {
        let platform = FakePlatform::new();
        platform.set_reachable(false);
        let pool = pool(&platform);

        let err = pool.get_or_open(&container(1, "Fake")).await.unwrap_err();
        assert!(matches!(err, CoreError::RemoteProvisioningFailure { .. }));
        assert_eq!(pool.open_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_container_type() {
        let platform = FakePlatform::new();
        let pool = pool(&platform);
        let err = pool.get_or_open(&container(1, "Vsphere")).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
