#![allow(dead_code)]

pub mod strategies;

use cloudmgr_core::models::{EntityKey, Resource, ResourceFilter};
use cloudmgr_core::orchestration::TaskState;
use cloudmgr_core::persistence::Pagination;
use cloudmgr_core::test_helpers::TestHarness;

pub use cloudmgr_core::test_helpers::{FakePlatform, TestHarness as Harness};

/// Every live resource in the harness container
pub async fn live_resources(harness: &TestHarness) -> Vec<Resource> {
    harness
        .plane
        .dispatcher()
        .list_resources(
            &ResourceFilter::by_container(harness.container.id),
            Pagination::unbounded(),
        )
        .await
        .expect("list resources")
        .items
}

pub async fn find_by_name(harness: &TestHarness, name: &str) -> Option<Resource> {
    live_resources(harness)
        .await
        .into_iter()
        .find(|resource| resource.name == name)
}

/// Wait for a background task and assert it finished in `expected`
pub async fn wait_for(harness: &TestHarness, task_id: &str, expected: TaskState) {
    let status = harness
        .plane
        .dispatcher()
        .wait_for_task(task_id)
        .await
        .expect("task is tracked");
    assert_eq!(
        status.state, expected,
        "task {task_id} finished as {:?}: {:?}",
        status.state, status.error
    );
}

pub fn id(resource: &Resource) -> EntityKey {
    EntityKey::Id(resource.id)
}
