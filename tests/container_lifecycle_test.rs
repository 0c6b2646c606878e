mod common;

use cloudmgr_core::error::CoreError;
use cloudmgr_core::models::{ContainerFilter, ContainerUpdate, EntityKey, ResourceFilter};
use cloudmgr_core::orchestration::ContainerRequest;
use cloudmgr_core::persistence::Pagination;
use cloudmgr_core::state_machine::ContainerState;
use cloudmgr_core::test_helpers::FakeDriver;
use common::{id, Harness};
use serde_json::json;

fn request(name: &str) -> ContainerRequest {
    ContainerRequest {
        name: name.to_string(),
        desc: String::new(),
        category: "Private".to_string(),
        container_type: FakeDriver::CONTAINER_TYPE.to_string(),
        implementation_class: FakeDriver::IMPLEMENTATION_CLASS.to_string(),
        connection: json!({}),
    }
}

#[tokio::test]
async fn added_container_is_active() {
    let harness = Harness::new().await;
    assert_eq!(harness.container.state, ContainerState::Active);
    assert!(harness.container.active);
    assert!(!harness.container.objid.contains("//"));

    let listed = harness
        .plane
        .containers()
        .list_containers(&ContainerFilter::default(), Pagination::unbounded())
        .await
        .unwrap();
    assert_eq!(listed.total, 1);
}

#[tokio::test]
async fn unreachable_platform_leaves_container_in_error() {
    let harness = Harness::new().await;
    harness.platform.set_reachable(false);

    let err = harness
        .plane
        .containers()
        .add_container(request("region-2"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::RemoteProvisioningFailure { .. }));

    let listed = harness
        .plane
        .containers()
        .list_containers(
            &ContainerFilter {
                name: Some("region-2".to_string()),
                ..Default::default()
            },
            Pagination::unbounded(),
        )
        .await
        .unwrap();
    assert_eq!(listed.items[0].state, ContainerState::Error);
    assert!(!listed.items[0].last_error.is_empty());
}

#[tokio::test]
async fn mismatched_driver_and_bad_connection_are_rejected() {
    let harness = Harness::new().await;
    let containers = harness.plane.containers();

    let mut wrong_class = request("region-2");
    wrong_class.implementation_class = "cloudmgr.other.Driver".to_string();
    assert!(matches!(
        containers.add_container(wrong_class).await.unwrap_err(),
        CoreError::Validation(_)
    ));

    let mut bad_connection = request("region-3");
    bad_connection.connection = json!("not-an-object");
    assert!(matches!(
        containers.add_container(bad_connection).await.unwrap_err(),
        CoreError::Validation(_)
    ));
}

#[tokio::test]
async fn live_state_follows_reachability() {
    let harness = Harness::new().await;
    let key = EntityKey::Id(harness.container.id);
    let containers = harness.plane.containers();

    assert_eq!(containers.container_state(&key).await.unwrap(), ContainerState::Active);
    harness.platform.set_reachable(false);
    assert_eq!(containers.container_state(&key).await.unwrap(), ContainerState::Error);

    containers.disable(&key).await.unwrap();
    assert_eq!(
        containers.container_state(&key).await.unwrap(),
        ContainerState::Disabled
    );
}

#[tokio::test]
async fn update_reconnects() {
    let harness = Harness::new().await;
    let key = EntityKey::Id(harness.container.id);
    let before = harness.platform.connect_count();

    let updated = harness
        .plane
        .containers()
        .update_container(
            &key,
            ContainerUpdate {
                desc: Some("moved".to_string()),
                connection: Some(json!({"endpoint": "fake://region-9"})),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.state, ContainerState::Active);
    assert_eq!(updated.desc, "moved");
    assert_eq!(harness.platform.connect_count(), before + 1);
}

#[tokio::test]
async fn expunge_requires_an_empty_container_unless_forced() {
    let harness = Harness::new().await;
    let key = EntityKey::Id(harness.container.id);
    let network = harness.create(Harness::NETWORK, "net-01", None).await;
    let server = harness.create(Harness::SERVER, "web-01", Some(&network)).await;

    let err = harness
        .plane
        .containers()
        .expunge_container(&key, false)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(
        harness.resource(&id(&server)).await.container_id,
        harness.container.id
    );

    harness
        .plane
        .containers()
        .expunge_container(&key, true)
        .await
        .unwrap();
    assert!(harness
        .plane
        .containers()
        .get_container(&key)
        .await
        .unwrap_err()
        .is_not_found());
    let remaining = harness
        .services
        .gateway
        .count_resources(&ResourceFilter::by_container(harness.container.id).including_deleted())
        .await
        .unwrap();
    assert_eq!(remaining, 0);
    assert_eq!(harness.platform.remote_count(), 0);
}

#[tokio::test]
async fn empty_container_expunges_without_force() {
    let harness = Harness::new().await;
    let key = EntityKey::Id(harness.container.id);
    harness
        .plane
        .containers()
        .expunge_container(&key, false)
        .await
        .unwrap();
    assert_eq!(harness.services.sessions.open_count(), 0);
}
