//! Resource lifecycle through the dispatcher against the fake platform

mod common;

use cloudmgr_core::auth::{operations, Grant, ObjidScopeAuthorizer};
use cloudmgr_core::constants::objtype;
use cloudmgr_core::error::CoreError;
use cloudmgr_core::graph::LinkRequest;
use cloudmgr_core::models::{EntityKey, JobFilter, LinkFilter, ResourceFilter};
use cloudmgr_core::orchestration::{CreateRequest, DispatchOutcome, TaskState};
use cloudmgr_core::persistence::Pagination;
use cloudmgr_core::state_machine::ResourceState;
use common::{find_by_name, id, live_resources, wait_for, Harness};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn sync_create_ends_active_with_ext_id() {
    let harness = Harness::new().await;
    let outcome = harness
        .plane
        .dispatcher()
        .create(
            CreateRequest::new(Harness::SERVER, harness.container.id, "web-01")
                .with_params(json!({"flavor": "small"}))
                .with_tags(["prod", "web"])
                .sync(true),
        )
        .await
        .unwrap();

    assert!(matches!(outcome, DispatchOutcome::Completed { .. }));
    let resource = harness.resource(&EntityKey::Uuid(outcome.uuid())).await;
    assert_eq!(resource.state, ResourceState::Active);
    assert!(resource.active);
    assert!(resource.has_ext_id());
    assert_eq!(resource.attribute, json!({"flavor": "small"}));
    assert!(resource.objid.starts_with(&harness.container.objid));
    assert!(harness.platform.remote(&resource.ext_id).is_some());

    let tags = harness
        .plane
        .dispatcher()
        .list_resource_tags(&id(&resource))
        .await
        .unwrap();
    assert_eq!(tags.len(), 2);
    assert_eq!(
        harness.platform.calls(),
        vec!["do_create".to_string(), "post_create".to_string()]
    );
}

#[tokio::test]
async fn business_failure_marks_error_and_skips_post_step() {
    let harness = Harness::new().await;
    harness
        .platform
        .fail_on("do_create", CoreError::remote(Harness::SERVER, "quota exceeded"));

    let err = harness
        .plane
        .dispatcher()
        .create(CreateRequest::new(Harness::SERVER, harness.container.id, "web-01").sync(true))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::RemoteProvisioningFailure { .. }));

    let resource = find_by_name(&harness, "web-01").await.unwrap();
    assert_eq!(resource.state, ResourceState::Error);
    assert!(resource.last_error.contains("quota exceeded"));
    assert!(!resource.active);
    assert_eq!(harness.platform.call_count("post_create"), 0);
}

#[tokio::test]
async fn pre_hook_rejection_leaves_nothing_behind() {
    let harness = Harness::new().await;
    let err = harness
        .plane
        .dispatcher()
        .create(
            CreateRequest::new(Harness::SERVER, harness.container.id, "web-01")
                .with_params(json!({"invalid": true}))
                .sync(true),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Validation(_)));
    assert!(live_resources(&harness).await.is_empty());
    assert!(harness.platform.calls().is_empty());
}

#[tokio::test]
async fn transient_persistence_failures_are_retried() {
    let harness = Harness::new().await;
    harness.platform.fail_times(
        "do_create",
        CoreError::transaction("update_resource", "deadlock detected"),
        2,
    );

    let resource = harness.create(Harness::SERVER, "web-01", None).await;
    assert_eq!(resource.state, ResourceState::Active);
    assert_eq!(harness.platform.call_count("do_create"), 3);
    // only one remote entity despite three attempts
    assert_eq!(harness.platform.remote_count(), 1);
}

#[tokio::test]
async fn async_create_is_tracked_as_a_job() {
    let harness = Harness::new().await;
    harness.platform.set_delay(Duration::from_millis(50));

    let outcome = harness
        .plane
        .dispatcher()
        .create(CreateRequest::new(Harness::SERVER, harness.container.id, "web-01"))
        .await
        .unwrap();
    let task_id = outcome.task_id().unwrap().to_string();

    let resource = harness.resource(&EntityKey::Uuid(outcome.uuid())).await;
    assert!(matches!(
        resource.state,
        ResourceState::Pending | ResourceState::Building
    ));

    let job = harness.plane.dispatcher().get_job(&task_id).await.unwrap();
    assert_eq!(job.resource_id, Some(resource.id));
    assert_eq!(job.container_id, Some(harness.container.id));
    assert_eq!(job.params["task_id"], json!(task_id));

    wait_for(&harness, &task_id, TaskState::Succeeded).await;
    let status = harness.plane.dispatcher().task_status(&task_id).unwrap();
    assert!(!status.progress.is_empty());
    // the job row was written before the task started
    assert!(job.created_at <= status.started_at.unwrap());
    assert_eq!(
        harness.resource(&id(&resource)).await.state,
        ResourceState::Active
    );
}

#[tokio::test]
async fn sync_calls_write_no_job() {
    let harness = Harness::new().await;
    harness.create(Harness::SERVER, "web-01", None).await;

    let jobs = harness
        .plane
        .dispatcher()
        .list_jobs(&JobFilter::default(), Pagination::unbounded())
        .await
        .unwrap();
    assert_eq!(jobs.total, 0);
}

#[tokio::test]
async fn second_operation_conflicts_while_first_holds_the_lock() {
    let harness = Harness::new().await;
    let resource = harness.create(Harness::SERVER, "web-01", None).await;
    harness.platform.set_delay(Duration::from_millis(100));

    let first = harness
        .plane
        .dispatcher()
        .update(&id(&resource), json!({"name": "web-02"}), Some(false))
        .await
        .unwrap();
    // wait until the background pipeline has taken the lock
    for _ in 0..50 {
        if harness.resource(&id(&resource)).await.state == ResourceState::Updating {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let err = harness
        .plane
        .dispatcher()
        .update(&id(&resource), json!({"name": "web-03"}), Some(true))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    wait_for(&harness, first.task_id().unwrap(), TaskState::Succeeded).await;
    let stored = harness.resource(&id(&resource)).await;
    assert_eq!(stored.name, "web-02");
    assert_eq!(stored.state, ResourceState::Active);
}

#[tokio::test]
async fn update_patch_and_action() {
    let harness = Harness::new().await;
    let resource = harness.create(Harness::SERVER, "web-01", None).await;
    let dispatcher = harness.plane.dispatcher();

    dispatcher
        .update(
            &id(&resource),
            json!({"name": "web-renamed", "desc": "frontend"}),
            Some(true),
        )
        .await
        .unwrap();
    let updated = harness.resource(&id(&resource)).await;
    assert_eq!(updated.name, "web-renamed");
    assert_eq!(updated.desc, "frontend");
    assert_eq!(
        harness.platform.remote(&updated.ext_id).unwrap().name,
        "web-renamed"
    );

    dispatcher
        .patch(&id(&resource), json!({"size": 4}), Some(true))
        .await
        .unwrap();
    assert_eq!(harness.resource(&id(&resource)).await.attribute["size"], 4);

    dispatcher
        .action(&id(&resource), "start", json!({}), Some(true))
        .await
        .unwrap();
    let started = harness.resource(&id(&resource)).await;
    assert_eq!(started.attribute["power"], "on");
    assert_eq!(started.attribute["size"], 4);
    assert_eq!(started.state, ResourceState::Active);

    let err = dispatcher
        .action(&id(&resource), "reboot", json!({}), Some(true))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));

    let err = dispatcher
        .patch(&id(&resource), json!([1, 2]), Some(true))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn import_adopts_a_remote_entity_once() {
    let harness = Harness::new().await;
    let ext_id = harness.platform.add_remote(Harness::SERVER, "legacy-db", None);
    harness
        .platform
        .set_remote_attributes(&ext_id, json!({"engine": "postgres"}));

    let outcome = harness
        .plane
        .dispatcher()
        .import(
            CreateRequest::new(Harness::SERVER, harness.container.id, "legacy-db")
                .with_ext_id(ext_id.clone())
                .sync(true),
        )
        .await
        .unwrap();
    let resource = harness.resource(&EntityKey::Uuid(outcome.uuid())).await;
    assert_eq!(resource.state, ResourceState::Active);
    assert_eq!(resource.ext_id, ext_id);
    assert_eq!(resource.attribute, json!({"engine": "postgres"}));

    let err = harness
        .plane
        .dispatcher()
        .import(
            CreateRequest::new(Harness::SERVER, harness.container.id, "again")
                .with_ext_id(ext_id)
                .sync(true),
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let err = harness
        .plane
        .dispatcher()
        .import(CreateRequest::new(Harness::SERVER, harness.container.id, "no-id").sync(true))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn delete_with_children_is_refused() {
    let harness = Harness::new().await;
    let network = harness.create(Harness::NETWORK, "net-01", None).await;
    let server = harness.create(Harness::SERVER, "web-01", Some(&network)).await;
    assert!(server.objid.starts_with(&network.objid));

    let err = harness
        .plane
        .dispatcher()
        .delete(&id(&network), false, Some(true))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(
        harness.resource(&id(&network)).await.state,
        ResourceState::Active
    );
    assert_eq!(
        harness
            .plane
            .dispatcher()
            .count_children(&id(&network))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn forced_delete_expunges_the_subtree() {
    let harness = Harness::new().await;
    let network = harness.create(Harness::NETWORK, "net-01", None).await;
    let server = harness.create(Harness::SERVER, "web-01", Some(&network)).await;

    harness
        .plane
        .dispatcher()
        .delete(&id(&network), true, Some(true))
        .await
        .unwrap();

    let deleted = harness.resource(&id(&network)).await;
    assert_eq!(deleted.state, ResourceState::Deleted);
    assert!(deleted.is_soft_deleted());
    assert!(harness.try_resource(&id(&server)).await.unwrap_err().is_not_found());
    assert!(harness.platform.remote(&server.ext_id).is_none());
}

#[tokio::test]
async fn forced_delete_holds_the_parent_while_the_subtree_goes() {
    let harness = Harness::new().await;
    let network = harness.create(Harness::NETWORK, "net-01", None).await;
    let server = harness.create(Harness::SERVER, "web-01", Some(&network)).await;
    harness.platform.set_delay(Duration::from_millis(100));

    let delete = harness
        .plane
        .dispatcher()
        .delete(&id(&network), true, Some(false))
        .await
        .unwrap();
    for _ in 0..50 {
        if harness.resource(&id(&network)).await.state == ResourceState::Deleting {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    // the child is still being expunged remotely
    assert!(harness.try_resource(&id(&server)).await.is_ok());

    let err = harness
        .plane
        .dispatcher()
        .update(&id(&network), json!({"name": "net-02"}), Some(true))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    wait_for(&harness, delete.task_id().unwrap(), TaskState::Succeeded).await;
    let deleted = harness.resource(&id(&network)).await;
    assert_eq!(deleted.state, ResourceState::Deleted);
    assert_eq!(deleted.name, "net-01");
    assert!(harness.try_resource(&id(&server)).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn forced_delete_leaves_children_alone_when_the_parent_is_busy() {
    let harness = Harness::new().await;
    let network = harness.create(Harness::NETWORK, "net-01", None).await;
    let server = harness.create(Harness::SERVER, "web-01", Some(&network)).await;
    harness.platform.set_delay(Duration::from_millis(100));

    let update = harness
        .plane
        .dispatcher()
        .update(&id(&network), json!({"name": "net-02"}), Some(false))
        .await
        .unwrap();
    for _ in 0..50 {
        if harness.resource(&id(&network)).await.state == ResourceState::Updating {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let err = harness
        .plane
        .dispatcher()
        .delete(&id(&network), true, Some(true))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    wait_for(&harness, update.task_id().unwrap(), TaskState::Succeeded).await;
    assert_eq!(harness.resource(&id(&network)).await.state, ResourceState::Active);
    assert_eq!(harness.resource(&id(&server)).await.state, ResourceState::Active);
    assert!(harness.platform.remote(&server.ext_id).is_some());
}

#[tokio::test]
async fn delete_then_expunge() {
    let harness = Harness::new().await;
    let resource = harness.create(Harness::SERVER, "web-01", None).await;
    let dispatcher = harness.plane.dispatcher();

    dispatcher.delete(&id(&resource), false, Some(true)).await.unwrap();
    assert!(find_by_name(&harness, "web-01").await.is_none());
    let deleted = dispatcher
        .list_resources(
            &ResourceFilter::by_container(harness.container.id).including_deleted(),
            Pagination::unbounded(),
        )
        .await
        .unwrap();
    assert_eq!(deleted.total, 1);

    dispatcher.expunge(&id(&resource), false, Some(true)).await.unwrap();
    assert!(harness.try_resource(&id(&resource)).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn expunge_removes_links_in_both_directions() {
    let harness = Harness::new().await;
    let web = harness.create(Harness::SERVER, "web-01", None).await;
    let db = harness.create(Harness::SERVER, "db-01", None).await;
    let cache = harness.create(Harness::SERVER, "cache-01", None).await;
    let graph = harness.plane.graph();

    graph.add_link(LinkRequest::new("uses", web.id, db.id)).await.unwrap();
    graph.add_link(LinkRequest::new("uses", cache.id, web.id)).await.unwrap();
    graph.add_link(LinkRequest::new("uses", cache.id, db.id)).await.unwrap();

    harness
        .plane
        .dispatcher()
        .expunge(&id(&web), false, Some(true))
        .await
        .unwrap();

    let remaining = graph
        .get_links(&LinkFilter::default(), Pagination::unbounded())
        .await
        .unwrap();
    assert_eq!(remaining.total, 1);
    assert!(graph.is_linked(cache.id, db.id, Some("uses")).await.unwrap());
    assert!(!graph.is_linked(web.id, db.id, None).await.unwrap());
}

#[tokio::test]
async fn disabled_resources_refuse_operations_until_enabled() {
    let harness = Harness::new().await;
    let resource = harness.create(Harness::SERVER, "web-01", None).await;
    let dispatcher = harness.plane.dispatcher();

    let disabled = dispatcher.disable(&id(&resource)).await.unwrap();
    assert_eq!(disabled.state, ResourceState::Disabled);
    assert!(dispatcher
        .update(&id(&resource), json!({"name": "x"}), Some(true))
        .await
        .unwrap_err()
        .is_conflict());

    let enabled = dispatcher.enable(&id(&resource)).await.unwrap();
    assert_eq!(enabled.state, ResourceState::Active);
}

#[tokio::test]
async fn create_is_refused_in_an_unusable_container() {
    let harness = Harness::new().await;
    harness
        .plane
        .containers()
        .disable(&EntityKey::Id(harness.container.id))
        .await
        .unwrap();

    let err = harness
        .plane
        .dispatcher()
        .create(CreateRequest::new(Harness::SERVER, harness.container.id, "web-01").sync(true))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert!(live_resources(&harness).await.is_empty());
}

#[tokio::test]
async fn lookup_by_ext_id_and_tags() {
    let harness = Harness::new().await;
    let resource = harness.create(Harness::SERVER, "web-01", None).await;
    let dispatcher = harness.plane.dispatcher();

    let found = dispatcher
        .get_resource_by_ext_id(&EntityKey::Id(harness.container.id), &resource.ext_id)
        .await
        .unwrap();
    assert_eq!(found.id, resource.id);

    assert!(dispatcher.add_resource_tag(&id(&resource), "blue").await.unwrap());
    assert!(!dispatcher.add_resource_tag(&id(&resource), "blue").await.unwrap());
    assert!(dispatcher.remove_resource_tag(&id(&resource), "blue").await.unwrap());
    assert!(dispatcher.list_resource_tags(&id(&resource)).await.unwrap().is_empty());
}

#[tokio::test]
async fn listing_leaves_out_resources_the_caller_cannot_view() {
    let authorizer = ObjidScopeAuthorizer::default()
        .with_grant(Grant::new(objtype::CONTAINER, "*", "*", &["*"]))
        .with_grant(Grant::new(
            objtype::RESOURCE,
            "*",
            "*",
            &[operations::INSERT, operations::UPDATE, operations::DELETE],
        ))
        .with_grant(Grant::new(
            objtype::RESOURCE,
            Harness::NETWORK,
            "*",
            &[operations::VIEW],
        ));
    let harness = Harness::with_authorizer(Arc::new(authorizer)).await;
    let network = harness.create(Harness::NETWORK, "net-01", None).await;
    let server = harness.create(Harness::SERVER, "web-01", None).await;

    let page = harness
        .plane
        .dispatcher()
        .list_resources(
            &ResourceFilter::by_container(harness.container.id),
            Pagination::unbounded(),
        )
        .await
        .unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].id, network.id);

    let err = harness
        .plane
        .dispatcher()
        .get_resource(&id(&server))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::AuthorizationDenied { .. }));
}
