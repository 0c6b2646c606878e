//! # Core Steps
//!
//! The pre- and post-steps shared by every pipeline, plus [`PluginHookStep`] which wraps
//! a resource plugin's `do_*`/`post_*` hook as a business step.
//!
//! All steps are safe to re-run: state transitions are skipped once the context says the
//! lock is held or the entity already reached the target state, tags are attached only
//! when missing, and removals treat an already missing row as done.

use super::context::OperationContext;
use super::pipeline::Step;
use super::services::CoreServices;
use crate::error::{CoreError, CoreResult};
use crate::graph::ResourceGraph;
use crate::models::{EntityKey, ResourceUpdate, TagTarget};
use crate::persistence::PersistenceGateway;
use crate::plugin::ResourcePlugin;
use crate::state_machine::{
    ContainerEvent, ContainerState, ContainerStateMachine, ResourceEvent, ResourceState,
    ResourceStateMachine,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Pre-step: moves the resource into its in-progress state and marks the lock as held
pub struct EnterResourceStateStep {
    resources: ResourceStateMachine,
    event: ResourceEvent,
    name: String,
    cascading: bool,
}

impl EnterResourceStateStep {
    pub fn new(resources: ResourceStateMachine, event: ResourceEvent) -> Self {
        let name = format!("enter_{}", event.event_type());
        Self {
            resources,
            event,
            name,
            cascading: false,
        }
    }

    /// Take the lock for an operation whose later steps remove the children
    pub fn cascading(resources: ResourceStateMachine, event: ResourceEvent) -> Self {
        Self {
            cascading: true,
            ..Self::new(resources, event)
        }
    }
}

#[async_trait]
impl Step for EnterResourceStateStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, mut ctx: OperationContext) -> CoreResult<OperationContext> {
        if ctx.lock_held {
            return Ok(ctx);
        }
        let resource_id = ctx.require_resource_id()?;
        let resource = if self.cascading {
            self.resources
                .transition_cascading(resource_id, self.event.clone())
                .await?
        } else {
            self.resources
                .transition(resource_id, self.event.clone())
                .await?
        };

        ctx.lock_held = true;
        ctx.objid = Some(resource.objid.clone());
        if ctx.ext_id.is_none() && resource.has_ext_id() {
            ctx.ext_id = Some(resource.ext_id);
        }
        Ok(ctx)
    }
}

/// Create pre-step companion: attaches the requested tags
pub struct ApplyTagsStep {
    gateway: Arc<dyn PersistenceGateway>,
}

impl ApplyTagsStep {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Step for ApplyTagsStep {
    fn name(&self) -> &str {
        "apply_tags"
    }

    async fn run(&self, ctx: OperationContext) -> CoreResult<OperationContext> {
        let resource_id = ctx.require_resource_id()?;
        for value in &ctx.tags {
            let tag = self.gateway.add_tag(value).await?;
            let attached = self
                .gateway
                .attach_tag(TagTarget::Resource(resource_id), tag.id)
                .await?;
            if !attached {
                debug!(resource_id, tag = %value, "Tag already attached");
            }
        }
        Ok(ctx)
    }
}

/// Plugin hook run as a business step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginHook {
    Create,
    PostCreate,
    Import,
    PostImport,
    Update,
    Patch,
    Delete,
    Expunge,
    Action,
}

impl PluginHook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "do_create",
            Self::PostCreate => "post_create",
            Self::Import => "do_import",
            Self::PostImport => "post_import",
            Self::Update => "do_update",
            Self::Patch => "do_patch",
            Self::Delete => "do_delete",
            Self::Expunge => "do_expunge",
            Self::Action => "do_action",
        }
    }
}

pub struct PluginHookStep {
    plugin: Arc<dyn ResourcePlugin>,
    services: CoreServices,
    hook: PluginHook,
}

impl PluginHookStep {
    pub fn new(plugin: Arc<dyn ResourcePlugin>, services: CoreServices, hook: PluginHook) -> Self {
        Self {
            plugin,
            services,
            hook,
        }
    }

    fn missing_capability(&self) -> CoreError {
        CoreError::Internal(format!(
            "{} does not implement {}",
            self.plugin.resource_type(),
            self.hook.as_str()
        ))
    }
}

#[async_trait]
impl Step for PluginHookStep {
    fn name(&self) -> &str {
        self.hook.as_str()
    }

    async fn run(&self, ctx: OperationContext) -> CoreResult<OperationContext> {
        let container = self
            .services
            .containers
            .get(&EntityKey::Id(ctx.container_id), false)
            .await?;
        let session = self.services.sessions.get_or_open(&container).await?;
        let plugin = self.plugin.as_ref();

        match self.hook {
            PluginHook::Create => {
                let creatable = plugin.creatable().ok_or_else(|| self.missing_capability())?;
                creatable.do_create(&session, ctx).await
            }
            PluginHook::PostCreate => {
                let creatable = plugin.creatable().ok_or_else(|| self.missing_capability())?;
                creatable.post_create(&session, ctx).await
            }
            PluginHook::Import => {
                let importable = plugin.importable().ok_or_else(|| self.missing_capability())?;
                importable.do_import(&session, ctx).await
            }
            PluginHook::PostImport => {
                let importable = plugin.importable().ok_or_else(|| self.missing_capability())?;
                importable.post_import(&session, ctx).await
            }
            PluginHook::Update => {
                let updatable = plugin.updatable().ok_or_else(|| self.missing_capability())?;
                updatable.do_update(&session, ctx).await
            }
            PluginHook::Patch => {
                let updatable = plugin.updatable().ok_or_else(|| self.missing_capability())?;
                updatable.do_patch(&session, ctx).await
            }
            PluginHook::Delete => {
                let deletable = plugin.deletable().ok_or_else(|| self.missing_capability())?;
                deletable.do_delete(&session, ctx).await
            }
            PluginHook::Expunge => {
                let deletable = plugin.deletable().ok_or_else(|| self.missing_capability())?;
                deletable.do_expunge(&session, ctx).await
            }
            PluginHook::Action => {
                let actionable = plugin.actionable().ok_or_else(|| self.missing_capability())?;
                actionable.do_action(&session, ctx).await
            }
        }
    }
}

/// Post-step for create, import, update, patch and action: persists `ext_id`,
/// `attribute` and `active = true`, then completes the transition to `ACTIVE`
pub struct FinalizeResourceStep {
    resources: ResourceStateMachine,
}

impl FinalizeResourceStep {
    pub fn new(resources: ResourceStateMachine) -> Self {
        Self { resources }
    }
}

#[async_trait]
impl Step for FinalizeResourceStep {
    fn name(&self) -> &str {
        "finalize"
    }

    async fn run(&self, mut ctx: OperationContext) -> CoreResult<OperationContext> {
        let resource_id = ctx.require_resource_id()?;
        let current = self.resources.get(&EntityKey::Id(resource_id), false).await?;
        if current.state == ResourceState::Active {
            return Ok(ctx);
        }

        let update = ResourceUpdate {
            name: (!ctx.name.is_empty() && ctx.name != current.name).then(|| ctx.name.clone()),
            desc: (ctx.desc != current.desc).then(|| ctx.desc.clone()),
            ext_id: ctx.ext_id.clone(),
            attribute: Some(ctx.attribute.clone()),
            active: Some(true),
        };
        self.resources.update_fields(resource_id, update).await?;
        let resource = self
            .resources
            .transition(resource_id, ResourceEvent::Complete)
            .await?;

        ctx.result = json!({
            "uuid": resource.uuid,
            "state": resource.state,
            "ext_id": resource.ext_id,
        });
        Ok(ctx)
    }
}

/// Post-step for delete: `DELETING → DELETED` with `expiry_date` set
pub struct SoftDeleteStep {
    resources: ResourceStateMachine,
}

impl SoftDeleteStep {
    pub fn new(resources: ResourceStateMachine) -> Self {
        Self { resources }
    }
}

#[async_trait]
impl Step for SoftDeleteStep {
    fn name(&self) -> &str {
        "soft_delete"
    }

    async fn run(&self, mut ctx: OperationContext) -> CoreResult<OperationContext> {
        let resource_id = ctx.require_resource_id()?;
        let current = self.resources.get(&EntityKey::Id(resource_id), false).await?;
        if current.state != ResourceState::Deleted {
            let resource = self.resources.soft_delete(resource_id).await?;
            ctx.result = json!({"uuid": resource.uuid, "state": resource.state});
        }
        Ok(ctx)
    }
}

/// Post-step for expunge: removes every link touching the resource, then the row
pub struct ExpungeResourceStep {
    resources: ResourceStateMachine,
    graph: ResourceGraph,
}

impl ExpungeResourceStep {
    pub fn new(resources: ResourceStateMachine, graph: ResourceGraph) -> Self {
        Self { resources, graph }
    }
}

#[async_trait]
impl Step for ExpungeResourceStep {
    fn name(&self) -> &str {
        "expunge"
    }

    async fn run(&self, mut ctx: OperationContext) -> CoreResult<OperationContext> {
        let resource_id = ctx.require_resource_id()?;
        match self.resources.get(&EntityKey::Id(resource_id), false).await {
            Ok(_) => {}
            // removed by an earlier attempt
            Err(err) if err.is_not_found() => return Ok(ctx),
            Err(err) => return Err(err),
        }

        let links = self.graph.expunge_links_for(resource_id).await?;
        self.resources.remove(resource_id).await?;
        ctx.result = json!({
            "uuid": ctx.resource_uuid,
            "state": ResourceState::Expunged,
            "links_removed": links,
        });
        Ok(ctx)
    }
}

/// Container pre-step: takes the container lock (e.g. `SYNCHRONIZE`)
pub struct EnterContainerStateStep {
    containers: ContainerStateMachine,
    event: ContainerEvent,
    name: String,
}

impl EnterContainerStateStep {
    pub fn new(containers: ContainerStateMachine, event: ContainerEvent) -> Self {
        let name = format!("enter_container_{}", event.event_type());
        Self {
            containers,
            event,
            name,
        }
    }
}

#[async_trait]
impl Step for EnterContainerStateStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, mut ctx: OperationContext) -> CoreResult<OperationContext> {
        if ctx.lock_held {
            return Ok(ctx);
        }
        let container = self
            .containers
            .transition(ctx.container_id, self.event.clone())
            .await?;
        ctx.lock_held = true;
        ctx.objid = Some(container.objid);
        Ok(ctx)
    }
}

/// Container post-step: releases the lock back to `ACTIVE`
pub struct CompleteContainerStep {
    containers: ContainerStateMachine,
}

impl CompleteContainerStep {
    pub fn new(containers: ContainerStateMachine) -> Self {
        Self { containers }
    }
}

#[async_trait]
impl Step for CompleteContainerStep {
    fn name(&self) -> &str {
        "complete_container"
    }

    async fn run(&self, ctx: OperationContext) -> CoreResult<OperationContext> {
        let current = self
            .containers
            .get(&EntityKey::Id(ctx.container_id), false)
            .await?;
        if current.state != ContainerState::Active {
            self.containers
                .transition(ctx.container_id, ContainerEvent::Complete)
                .await?;
        }
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::context::Operation;
    use crate::test_helpers::TestHarness;

    #[tokio::test]
    async fn test_enter_state_is_idempotent_once_locked() {
        let harness = TestHarness::new().await;
        let resource = harness.pending_resource("web-01").await;
        let step = EnterResourceStateStep::new(harness.services.resources.clone(), ResourceEvent::Build);

        let ctx = OperationContext::new(Operation::Create, "Fake.Server", resource.container_id)
            .with_resource(resource.id, resource.uuid);
        let ctx = step.run(ctx).await.unwrap();
        assert!(ctx.lock_held);

        // a second run must not attempt BUILDING → BUILDING
        let ctx = step.run(ctx).await.unwrap();
        let stored = harness
            .services
            .resources
            .get(&EntityKey::Id(resource.id), false)
            .await
            .unwrap();
        assert_eq!(stored.state, ResourceState::Building);
        assert_eq!(ctx.objid.as_deref(), Some(resource.objid.as_str()));
    }

    #[tokio::test]
    async fn test_apply_tags_twice_attaches_once() {
        let harness = TestHarness::new().await;
        let resource = harness.pending_resource("web-01").await;
        let step = ApplyTagsStep::new(harness.services.gateway.clone());

        let ctx = OperationContext::new(Operation::Create, "Fake.Server", resource.container_id)
            .with_resource(resource.id, resource.uuid)
            .with_tags(vec!["prod".to_string(), "web".to_string()]);
        let ctx = step.run(ctx).await.unwrap();
        step.run(ctx).await.unwrap();

        let tags = harness
            .services
            .gateway
            .list_tags(TagTarget::Resource(resource.id))
            .await
            .unwrap();
        assert_eq!(tags.len(), 2);
    }

    #[tokio::test]
    async fn test_finalize_persists_outcome() {
        let harness = TestHarness::new().await;
        let resource = harness.pending_resource("web-01").await;
        harness
            .services
            .resources
            .transition(resource.id, ResourceEvent::Build)
            .await
            .unwrap();

        let mut ctx = OperationContext::new(Operation::Create, "Fake.Server", resource.container_id)
            .with_resource(resource.id, resource.uuid)
            .with_name("web-01")
            .with_ext_id("srv-123");
        ctx.attribute = json!({"flavor": "small"});

        let step = FinalizeResourceStep::new(harness.services.resources.clone());
        let ctx = step.run(ctx).await.unwrap();
        // already ACTIVE, the re-run is a no-op
        step.run(ctx).await.unwrap();

        let stored = harness
            .services
            .resources
            .get(&EntityKey::Id(resource.id), false)
            .await
            .unwrap();
        assert_eq!(stored.state, ResourceState::Active);
        assert!(stored.active);
        assert_eq!(stored.ext_id, "srv-123");
        assert_eq!(stored.attribute, json!({"flavor": "small"}));
    }

    #[tokio::test]
    async fn test_expunge_step_tolerates_missing_row() {
        let harness = TestHarness::new().await;
        let step = ExpungeResourceStep::new(
            harness.services.resources.clone(),
            harness.services.graph.clone(),
        );
        let ctx = OperationContext::new(Operation::Expunge, "Fake.Server", harness.container.id)
            .with_resource(424242, uuid::Uuid::new_v4());
        assert!(step.run(ctx).await.is_ok());
    }
}
