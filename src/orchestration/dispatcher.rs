//! # Operation Dispatcher
//!
//! Entry point for every resource lifecycle operation. Each call follows the same
//! sequence:
//!
//! 1. resolve the resource (or its container and parent for creation) and the plugin
//!    for its type
//! 2. ask the [`Authorizer`] about the operation on the entity's objid
//! 3. check the state gate (and guards) without writing anything, so conflicts surface
//!    before any side effect
//! 4. run the plugin's `pre_*` hook
//! 5. for create/import, insert the row in `PENDING` so the resource has a durable
//!    identity whatever happens to provisioning
//! 6. hand the assembled pipeline to the [`TaskExecutor`], inline when `sync` is set and
//!    in the background otherwise (writing a [`Job`] audit record)
//!
//! When the caller does not say, operations of plugins that call a remote platform run
//! in the background.

use super::assembler::{context_for, PipelineAssembler};
use super::context::{Operation, OperationContext};
use super::executor::{TaskExecutor, TaskStatus};
use super::pipeline::Pipeline;
use super::services::CoreServices;
use crate::auth::{operations, Authorizer};
use crate::constants::objtype;
use crate::error::{CoreError, CoreResult};
use crate::logging::log_resource_operation;
use crate::models::{
    merge_attribute, objid, Container, EntityKey, Job, JobFilter, NewJob, NewResource, Resource,
    ResourceFilter, ResourceTag, TagTarget,
};
use crate::persistence::{PaginatedResult, Pagination};
use crate::plugin::ResourcePlugin;
use crate::registry::ResourceTypeRegistry;
use crate::state_machine::{ResourceEvent, ResourceState, ResourceStateMachine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Parameters of a create or import call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub resource_type: String,
    pub container: EntityKey,
    pub parent: Option<EntityKey>,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Remote identifier of the entity to import
    pub ext_id: Option<String>,
    /// `None` lets the plugin decide
    pub sync: Option<bool>,
}

impl CreateRequest {
    pub fn new(
        resource_type: impl Into<String>,
        container: impl Into<EntityKey>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            container: container.into(),
            parent: None,
            name: name.into(),
            desc: String::new(),
            params: Value::Object(Default::default()),
            tags: Vec::new(),
            ext_id: None,
            sync: None,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<EntityKey>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ext_id(mut self, ext_id: impl Into<String>) -> Self {
        self.ext_id = Some(ext_id.into());
        self
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = Some(sync);
        self
    }
}

/// What the caller gets back from a dispatched operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Pipeline ran inline and finished
    Completed { uuid: Uuid, result: Value },
    /// Pipeline runs in the background; the resource is already visible
    Submitted { uuid: Uuid, task_id: String },
}

impl DispatchOutcome {
    pub fn uuid(&self) -> Uuid {
        match self {
            Self::Completed { uuid, .. } | Self::Submitted { uuid, .. } => *uuid,
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Submitted { task_id, .. } => Some(task_id),
            Self::Completed { .. } => None,
        }
    }
}

pub struct OperationDispatcher {
    services: CoreServices,
    registry: Arc<ResourceTypeRegistry>,
    assembler: Arc<PipelineAssembler>,
    executor: Arc<dyn TaskExecutor>,
    authorizer: Arc<dyn Authorizer>,
}

impl OperationDispatcher {
    pub fn new(
        services: CoreServices,
        registry: Arc<ResourceTypeRegistry>,
        assembler: Arc<PipelineAssembler>,
        executor: Arc<dyn TaskExecutor>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            services,
            registry,
            assembler,
            executor,
            authorizer,
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------------

    /// Create a resource: insert it in `PENDING`, then provision it remotely
    #[instrument(skip(self, request), fields(resource_type = %request.resource_type, name = %request.name))]
    pub async fn create(&self, request: CreateRequest) -> CoreResult<DispatchOutcome> {
        let plugin = self.registry.get(&request.resource_type)?;
        let (container, parent) = self.resolve_placement(&plugin, &request).await?;
        let scope = parent.as_ref().map_or(&container.objid, |p| &p.objid).clone();
        self.authorize(plugin.resource_type(), &scope, Operation::Create)
            .await?;

        let creatable = plugin
            .creatable()
            .ok_or_else(|| unsupported(plugin.as_ref(), Operation::Create))?;
        ensure_container_usable(&container)?;

        let ctx = initial_context(Operation::Create, &request, &container, parent.as_ref());
        let ctx = creatable.pre_create(&container, ctx).await?;
        let ctx = self.insert_pending(plugin.as_ref(), ctx, &scope).await?;

        let pipeline = Arc::new(self.assembler.create_pipeline(&plugin));
        self.dispatch(pipeline, ctx, request.sync.unwrap_or(!plugin.runs_remote()))
            .await
    }

    /// Adopt an existing remote entity by `ext_id`
    #[instrument(skip(self, request), fields(resource_type = %request.resource_type, name = %request.name))]
    pub async fn import(&self, request: CreateRequest) -> CoreResult<DispatchOutcome> {
        let ext_id = match request.ext_id.as_deref().map(str::trim) {
            Some(ext_id) if !ext_id.is_empty() => ext_id.to_string(),
            _ => return Err(CoreError::Validation("import requires an ext_id".to_string())),
        };
        let plugin = self.registry.get(&request.resource_type)?;
        let (container, parent) = self.resolve_placement(&plugin, &request).await?;
        let scope = parent.as_ref().map_or(&container.objid, |p| &p.objid).clone();
        self.authorize(plugin.resource_type(), &scope, Operation::Import)
            .await?;

        let importable = plugin
            .importable()
            .ok_or_else(|| unsupported(plugin.as_ref(), Operation::Import))?;
        ensure_container_usable(&container)?;
        if let Ok(existing) = self
            .services
            .gateway
            .get_resource_by_ext_id(container.id, &ext_id)
            .await
        {
            return Err(CoreError::conflict(
                "resource",
                existing.id,
                format!("ext_id {ext_id} is already tracked"),
            ));
        }

        let ctx = initial_context(Operation::Import, &request, &container, parent.as_ref())
            .with_ext_id(ext_id);
        let ctx = importable.pre_import(&container, ctx).await?;
        let ctx = self.insert_pending(plugin.as_ref(), ctx, &scope).await?;

        let pipeline = Arc::new(self.assembler.import_pipeline(&plugin));
        self.dispatch(pipeline, ctx, request.sync.unwrap_or(!plugin.runs_remote()))
            .await
    }

    /// Full update: `params` carries the new values (`name`, `desc` and plugin fields)
    #[instrument(skip(self, params))]
    pub async fn update(
        &self,
        key: &EntityKey,
        params: Value,
        sync: Option<bool>,
    ) -> CoreResult<DispatchOutcome> {
        let (resource, plugin) = self
            .prepare_existing(key, Operation::Update, &ResourceEvent::Update, false)
            .await?;
        let updatable = plugin
            .updatable()
            .ok_or_else(|| unsupported(plugin.as_ref(), Operation::Update))?;

        let mut ctx = context_for(Operation::Update, &resource).with_params(params);
        apply_identity_params(&mut ctx);
        let ctx = updatable.pre_update(&resource, ctx).await?;

        let pipeline = Arc::new(self.assembler.mutation_pipeline(&plugin, Operation::Update));
        self.dispatch(pipeline, ctx, sync.unwrap_or(!plugin.runs_remote()))
            .await
    }

    /// Merge-patch the attribute blob
    #[instrument(skip(self, patch))]
    pub async fn patch(
        &self,
        key: &EntityKey,
        patch: Value,
        sync: Option<bool>,
    ) -> CoreResult<DispatchOutcome> {
        if !patch.is_object() {
            return Err(CoreError::Validation("patch must be a JSON object".to_string()));
        }
        let (resource, plugin) = self
            .prepare_existing(key, Operation::Patch, &ResourceEvent::Update, false)
            .await?;
        let updatable = plugin
            .updatable()
            .ok_or_else(|| unsupported(plugin.as_ref(), Operation::Patch))?;

        let mut ctx = context_for(Operation::Patch, &resource);
        merge_attribute(&mut ctx.attribute, &patch);
        ctx.params = patch;
        let ctx = updatable.pre_patch(&resource, ctx).await?;

        let pipeline = Arc::new(self.assembler.mutation_pipeline(&plugin, Operation::Patch));
        self.dispatch(pipeline, ctx, sync.unwrap_or(!plugin.runs_remote()))
            .await
    }

    /// Run a named plugin action
    #[instrument(skip(self, params))]
    pub async fn action(
        &self,
        key: &EntityKey,
        action: &str,
        params: Value,
        sync: Option<bool>,
    ) -> CoreResult<DispatchOutcome> {
        let (resource, plugin) = self
            .prepare_existing(key, Operation::Action, &ResourceEvent::Update, false)
            .await?;
        let actionable = plugin
            .actionable()
            .ok_or_else(|| unsupported(plugin.as_ref(), Operation::Action))?;
        if !actionable.actions().iter().any(|known| known == action) {
            return Err(CoreError::Validation(format!(
                "{} has no action {action}",
                plugin.resource_type()
            )));
        }

        let ctx = context_for(Operation::Action, &resource)
            .with_action(action)
            .with_params(params);
        let ctx = actionable.pre_action(&resource, ctx).await?;

        let pipeline = Arc::new(self.assembler.mutation_pipeline(&plugin, Operation::Action));
        self.dispatch(pipeline, ctx, sync.unwrap_or(!plugin.runs_remote()))
            .await
    }

    /// Soft delete. With `force`, the subtree below the resource is expunged first.
    #[instrument(skip(self))]
    pub async fn delete(
        &self,
        key: &EntityKey,
        force: bool,
        sync: Option<bool>,
    ) -> CoreResult<DispatchOutcome> {
        let (resource, plugin) = self
            .prepare_existing(key, Operation::Delete, &ResourceEvent::Delete, force)
            .await?;

        let mut ctx = context_for(Operation::Delete, &resource).with_force(force);
        if let Some(deletable) = plugin.deletable() {
            ctx = deletable.pre_delete(&resource, ctx).await?;
        }

        let pipeline = Arc::new(self.assembler.delete_pipeline(&plugin, force));
        self.dispatch(pipeline, ctx, sync.unwrap_or(!plugin.runs_remote()))
            .await
    }

    /// Hard delete. Links touching the resource are removed before the row.
    #[instrument(skip(self))]
    pub async fn expunge(
        &self,
        key: &EntityKey,
        force: bool,
        sync: Option<bool>,
    ) -> CoreResult<DispatchOutcome> {
        let (resource, plugin) = self
            .prepare_existing(key, Operation::Expunge, &ResourceEvent::Expunge { force }, false)
            .await?;

        let mut ctx = context_for(Operation::Expunge, &resource).with_force(force);
        if let Some(deletable) = plugin.deletable() {
            ctx = deletable.pre_expunge(&resource, ctx).await?;
        }

        let pipeline = Arc::new(self.assembler.expunge_pipeline(&plugin, force));
        self.dispatch(pipeline, ctx, sync.unwrap_or(!plugin.runs_remote()))
            .await
    }

    /// Administratively freeze a resource
    pub async fn disable(&self, key: &EntityKey) -> CoreResult<Resource> {
        self.admin_transition(key, ResourceEvent::Disable).await
    }

    pub async fn enable(&self, key: &EntityKey) -> CoreResult<Resource> {
        self.admin_transition(key, ResourceEvent::Enable).await
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub async fn get_resource(&self, key: &EntityKey) -> CoreResult<Resource> {
        let resource = self.services.resources.get(key, true).await?;
        self.authorizer
            .check_authorization(
                objtype::RESOURCE,
                &resource.resource_type,
                &resource.objid,
                operations::VIEW,
            )
            .await?;
        Ok(resource)
    }

    /// One page of matching resources the caller may view. `total` counts every matching
    /// row; rows failing the view check are left out of `items`.
    pub async fn list_resources(
        &self,
        filter: &ResourceFilter,
        page: Pagination,
    ) -> CoreResult<PaginatedResult<Resource>> {
        let mut result = self.services.gateway.list_resources(filter, page).await?;
        let mut visible = Vec::with_capacity(result.items.len());
        for resource in std::mem::take(&mut result.items) {
            match self
                .authorizer
                .check_authorization(
                    objtype::RESOURCE,
                    &resource.resource_type,
                    &resource.objid,
                    operations::VIEW,
                )
                .await
            {
                Ok(()) => visible.push(resource),
                Err(CoreError::AuthorizationDenied { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        result.items = visible;
        Ok(result)
    }

    /// Children of a resource, soft-deleted ones included
    pub async fn count_children(&self, key: &EntityKey) -> CoreResult<u64> {
        let resource = self.services.resources.get(key, true).await?;
        Ok(self
            .services
            .gateway
            .count_resources(&ResourceFilter::children_of(resource.id))
            .await?)
    }

    pub async fn get_resource_by_ext_id(
        &self,
        container: &EntityKey,
        ext_id: &str,
    ) -> CoreResult<Resource> {
        let container = self.services.containers.get(container, true).await?;
        Ok(self
            .services
            .gateway
            .get_resource_by_ext_id(container.id, ext_id)
            .await?)
    }

    pub async fn add_resource_tag(&self, key: &EntityKey, value: &str) -> CoreResult<bool> {
        let resource = self.services.resources.get(key, false).await?;
        self.authorize(&resource.resource_type, &resource.objid, Operation::Update)
            .await?;
        let tag = self.services.gateway.add_tag(value).await?;
        Ok(self
            .services
            .gateway
            .attach_tag(TagTarget::Resource(resource.id), tag.id)
            .await?)
    }

    pub async fn remove_resource_tag(&self, key: &EntityKey, value: &str) -> CoreResult<bool> {
        let resource = self.services.resources.get(key, false).await?;
        self.authorize(&resource.resource_type, &resource.objid, Operation::Update)
            .await?;
        let tags = self.list_resource_tags_by_id(resource.id).await?;
        match tags.into_iter().find(|tag| tag.value == value) {
            Some(tag) => Ok(self
                .services
                .gateway
                .detach_tag(TagTarget::Resource(resource.id), tag.id)
                .await?),
            None => Ok(false),
        }
    }

    pub async fn list_resource_tags(&self, key: &EntityKey) -> CoreResult<Vec<ResourceTag>> {
        let resource = self.services.resources.get(key, true).await?;
        self.list_resource_tags_by_id(resource.id).await
    }

    async fn list_resource_tags_by_id(&self, resource_id: i64) -> CoreResult<Vec<ResourceTag>> {
        Ok(self
            .services
            .gateway
            .list_tags(TagTarget::Resource(resource_id))
            .await?)
    }

    pub async fn get_job(&self, job_id: &str) -> CoreResult<Job> {
        Ok(self.services.gateway.get_job(job_id).await?)
    }

    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        page: Pagination,
    ) -> CoreResult<PaginatedResult<Job>> {
        Ok(self.services.gateway.list_jobs(filter, page).await?)
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.executor.status(task_id)
    }

    pub async fn wait_for_task(&self, task_id: &str) -> CoreResult<TaskStatus> {
        self.executor.wait(task_id).await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn authorize(&self, objdef: &str, objid: &str, operation: Operation) -> CoreResult<()> {
        self.authorizer
            .check_authorization(
                objtype::RESOURCE,
                objdef,
                objid,
                operation.authorization_operation(),
            )
            .await
    }

    /// Container and optional parent a new resource goes under
    async fn resolve_placement(
        &self,
        plugin: &Arc<dyn ResourcePlugin>,
        request: &CreateRequest,
    ) -> CoreResult<(Container, Option<Resource>)> {
        if request.name.trim().is_empty() {
            return Err(CoreError::Validation("resource name must not be empty".to_string()));
        }
        let container = self.services.containers.get(&request.container, true).await?;
        if container.container_type != plugin.container_type() {
            return Err(CoreError::Validation(format!(
                "{} resources cannot live in a {} container",
                plugin.resource_type(),
                container.container_type
            )));
        }

        let parent = match &request.parent {
            Some(key) => {
                let parent = self.services.resources.get(key, false).await?;
                if parent.container_id != container.id {
                    return Err(CoreError::Validation(format!(
                        "parent {} belongs to container {}, not {}",
                        parent.id, parent.container_id, container.id
                    )));
                }
                if parent.is_soft_deleted() {
                    return Err(CoreError::conflict("resource", parent.id, "parent is deleted"));
                }
                Some(parent)
            }
            None => None,
        };
        Ok((container, parent))
    }

    /// Insert the `PENDING` row; the objid hangs below `scope_objid`
    async fn insert_pending(
        &self,
        plugin: &dyn ResourcePlugin,
        mut ctx: OperationContext,
        scope_objid: &str,
    ) -> CoreResult<OperationContext> {
        let resource = self
            .services
            .gateway
            .add_resource(NewResource {
                objid: objid::child_of(scope_objid),
                name: ctx.name.clone(),
                desc: ctx.desc.clone(),
                resource_type: plugin.resource_type().to_string(),
                implementation_class: plugin.implementation_class().to_string(),
                container_id: ctx.container_id,
                parent_id: ctx.parent_id,
                ext_id: String::new(),
                state: ResourceState::Pending,
                active: false,
                attribute: ctx.attribute.clone(),
            })
            .await?;

        log_resource_operation(
            ctx.operation.as_str(),
            Some(resource.id),
            &resource.resource_type,
            resource.state.as_str(),
            Some(&resource.objid),
        );
        ctx.objid = Some(resource.objid.clone());
        Ok(ctx.with_resource(resource.id, resource.uuid))
    }

    /// Load, authorize and gate-check an existing resource
    async fn prepare_existing(
        &self,
        key: &EntityKey,
        operation: Operation,
        event: &ResourceEvent,
        state_gate_only: bool,
    ) -> CoreResult<(Resource, Arc<dyn ResourcePlugin>)> {
        let resource = self.services.resources.get(key, false).await?;
        self.authorize(&resource.resource_type, &resource.objid, operation)
            .await?;
        let plugin = self.registry.get(&resource.resource_type)?;

        if state_gate_only {
            ResourceStateMachine::determine_target_state(&resource, event)?;
        } else {
            self.services.resources.ensure_allowed(&resource, event).await?;
        }
        Ok((resource, plugin))
    }

    async fn admin_transition(&self, key: &EntityKey, event: ResourceEvent) -> CoreResult<Resource> {
        let resource = self.services.resources.get(key, false).await?;
        self.authorize(&resource.resource_type, &resource.objid, Operation::Update)
            .await?;
        let updated = self.services.resources.transition(resource.id, event.clone()).await?;
        log_resource_operation(
            event.event_type(),
            Some(updated.id),
            &updated.resource_type,
            updated.state.as_str(),
            None,
        );
        Ok(updated)
    }

    async fn dispatch(
        &self,
        pipeline: Arc<Pipeline>,
        mut ctx: OperationContext,
        sync: bool,
    ) -> CoreResult<DispatchOutcome> {
        let uuid = ctx
            .resource_uuid
            .ok_or_else(|| CoreError::Internal(format!("{} has no resource", pipeline.name())))?;
        debug!(pipeline = pipeline.name(), sync, "Dispatching pipeline");

        if sync {
            let ctx = self.executor.run_inline(&pipeline, ctx).await?;
            return Ok(DispatchOutcome::Completed {
                uuid,
                result: ctx.result,
            });
        }

        // the job row exists before the task can run
        let task_id = self.executor.new_task_id();
        ctx.task_id = Some(task_id.clone());
        self.services
            .gateway
            .add_job(NewJob {
                job_id: task_id.clone(),
                name: pipeline.name().to_string(),
                resource_id: ctx.resource_id,
                container_id: Some(ctx.container_id),
                params: serde_json::to_value(&ctx)?,
            })
            .await?;
        self.executor.submit(pipeline, ctx).await?;
        Ok(DispatchOutcome::Submitted { uuid, task_id })
    }
}

fn unsupported(plugin: &dyn ResourcePlugin, operation: Operation) -> CoreError {
    CoreError::Validation(format!(
        "resource type {} does not support {operation}",
        plugin.resource_type()
    ))
}

fn ensure_container_usable(container: &Container) -> CoreResult<()> {
    if container.is_usable() {
        Ok(())
    } else {
        Err(CoreError::conflict(
            "container",
            container.id,
            format!("state {} does not accept resource operations", container.state),
        ))
    }
}

fn initial_context(
    operation: Operation,
    request: &CreateRequest,
    container: &Container,
    parent: Option<&Resource>,
) -> OperationContext {
    OperationContext::new(operation, &request.resource_type, container.id)
        .with_name(request.name.trim())
        .with_desc(&request.desc)
        .with_parent(parent.map(|p| p.id))
        .with_params(request.params.clone())
        .with_tags(request.tags.clone())
}

/// `name` and `desc` in update params replace the stored values
fn apply_identity_params(ctx: &mut OperationContext) {
    if let Some(name) = ctx.param_str("name").map(str::to_string) {
        ctx.name = name;
    }
    if let Some(desc) = ctx.param_str("desc").map(str::to_string) {
        ctx.desc = desc;
    }
}
