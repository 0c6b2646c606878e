//! Gateway behaviour against a live PostgreSQL database.
//!
//! Run with `DATABASE_URL=postgresql://... cargo test -- --ignored`.
#![cfg(feature = "postgres")]

use cloudmgr_core::config::{ConfigManager, CoreConfig, DatabaseConfig};
use cloudmgr_core::models::{objid, NewContainer, NewResource, ResourceFilter};
use cloudmgr_core::orchestration::{ContainerRequest, ControlPlane, CreateRequest};
use cloudmgr_core::persistence::{Pagination, PersistenceGateway, PgGateway};
use cloudmgr_core::state_machine::ResourceState;
use cloudmgr_core::test_helpers::{FakeDriver, FakePlatform, FakeResourcePlugin};
use serde_json::json;
use std::sync::Arc;

fn database_config() -> DatabaseConfig {
    DatabaseConfig {
        url: std::env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
        ..Default::default()
    }
}

async fn gateway() -> PgGateway {
    let gateway = PgGateway::connect(&database_config()).await.unwrap();
    gateway.migrate().await.unwrap();
    gateway
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

async fn container(gateway: &PgGateway) -> i64 {
    gateway
        .add_container(NewContainer {
            objid: objid::root(),
            name: unique("region"),
            desc: String::new(),
            category: "Private".to_string(),
            container_type: FakeDriver::CONTAINER_TYPE.to_string(),
            implementation_class: FakeDriver::IMPLEMENTATION_CLASS.to_string(),
            connection: json!({}),
        })
        .await
        .unwrap()
        .id
}

fn new_resource(container_id: i64, objid: String) -> NewResource {
    NewResource {
        objid,
        name: unique("web"),
        desc: String::new(),
        resource_type: "Fake.Server".to_string(),
        implementation_class: "cloudmgr.fake.Fake.Server".to_string(),
        container_id,
        parent_id: None,
        ext_id: String::new(),
        state: ResourceState::Pending,
        active: false,
        attribute: json!({}),
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn health_check_succeeds_after_migration() {
    assert!(gateway().await.health_check().await.unwrap());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn state_transition_is_compare_and_swap() {
    let gateway = gateway().await;
    let container_id = container(&gateway).await;
    let resource = gateway
        .add_resource(new_resource(container_id, objid::root()))
        .await
        .unwrap();

    let building = gateway
        .transition_resource_state(resource.id, &[ResourceState::Pending], ResourceState::Building)
        .await
        .unwrap();
    assert_eq!(building.state, ResourceState::Building);

    let second = gateway
        .transition_resource_state(resource.id, &[ResourceState::Pending], ResourceState::Building)
        .await;
    assert!(second.is_err());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn soft_deleted_rows_are_hidden_by_default() {
    let gateway = gateway().await;
    let container_id = container(&gateway).await;
    let resource = gateway
        .add_resource(new_resource(container_id, objid::root()))
        .await
        .unwrap();
    gateway.soft_delete_resource(resource.id).await.unwrap();

    let filter = ResourceFilter::by_container(container_id);
    assert_eq!(gateway.count_resources(&filter).await.unwrap(), 0);
    assert_eq!(
        gateway
            .count_resources(&filter.including_deleted())
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn control_plane_runs_on_postgres() {
    let mut config = CoreConfig::default();
    config.database = database_config();
    let platform = FakePlatform::new();
    let plane = ControlPlane::builder(ConfigManager::from_config(config).unwrap())
        .driver(Arc::new(FakeDriver::new(platform.clone())))
        .unwrap()
        .resource_type(Arc::new(FakeResourcePlugin::new("Fake.Server", platform)))
        .unwrap()
        .connect()
        .await
        .unwrap();

    let container = plane
        .containers()
        .add_container(ContainerRequest {
            name: unique("region"),
            desc: String::new(),
            category: "Private".to_string(),
            container_type: FakeDriver::CONTAINER_TYPE.to_string(),
            implementation_class: FakeDriver::IMPLEMENTATION_CLASS.to_string(),
            connection: json!({}),
        })
        .await
        .unwrap();
    plane
        .dispatcher()
        .create(CreateRequest::new("Fake.Server", container.id, "web-01").sync(true))
        .await
        .unwrap();

    let gateway = &plane.services().gateway;
    let listed = gateway
        .list_resources(&ResourceFilter::by_container(container.id), Pagination::unbounded())
        .await
        .unwrap();
    assert_eq!(listed.total, 1);
    let stored = &listed.items[0];
    assert_eq!(stored.state, ResourceState::Active);
    assert_eq!(
        gateway
            .get_resource_by_ext_id(container.id, &stored.ext_id)
            .await
            .unwrap()
            .id,
        stored.id
    );
}
