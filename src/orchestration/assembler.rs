//! # Pipeline Assembly
//!
//! Builds the concrete [`Pipeline`] for each lifecycle operation out of the core steps
//! and the resource plugin's hooks:
//!
//! | operation | pre-step              | business steps                   | post-step  |
//! |-----------|-----------------------|----------------------------------|------------|
//! | create    | `BUILDING`, tags      | `do_create`, `post_create`       | finalize   |
//! | import    | `BUILDING`, tags      | `do_import`, `post_import`       | finalize   |
//! | update    | `UPDATING`            | `do_update`                      | finalize   |
//! | patch     | `UPDATING`            | `do_patch`                       | finalize   |
//! | action    | `UPDATING`            | `do_action`                      | finalize   |
//! | delete    | `DELETING`            | `do_delete`                      | soft delete|
//! | expunge   | `EXPUNGING`           | `do_expunge`                     | expunge    |
//!
//! Forced delete and expunge take the resource's lock first and then run a cascade step
//! that expunges the whole subtree below it, deepest first. Plugin extra steps go after
//! the `do_*` hooks.

use super::context::{Operation, OperationContext};
use super::pipeline::{Pipeline, ResourceFailureHandler, RetryPolicy, Step};
use super::services::CoreServices;
use super::steps::{
    ApplyTagsStep, EnterResourceStateStep, ExpungeResourceStep, FinalizeResourceStep,
    PluginHook, PluginHookStep, SoftDeleteStep,
};
use crate::error::CoreResult;
use crate::models::{EntityKey, Resource, ResourceFilter};
use crate::persistence::Pagination;
use crate::plugin::ResourcePlugin;
use crate::registry::ResourceTypeRegistry;
use crate::state_machine::ResourceEvent;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::info;

pub struct PipelineAssembler {
    services: CoreServices,
    registry: Arc<ResourceTypeRegistry>,
    retry: RetryPolicy,
}

impl PipelineAssembler {
    pub fn new(services: CoreServices, registry: Arc<ResourceTypeRegistry>, retry: RetryPolicy) -> Self {
        Self {
            services,
            registry,
            retry,
        }
    }

    fn hook(&self, plugin: &Arc<dyn ResourcePlugin>, hook: PluginHook) -> Arc<dyn Step> {
        Arc::new(PluginHookStep::new(plugin.clone(), self.services.clone(), hook))
    }

    fn enter(&self, event: ResourceEvent) -> Arc<dyn Step> {
        Arc::new(EnterResourceStateStep::new(self.services.resources.clone(), event))
    }

    fn finalize(&self) -> Arc<dyn Step> {
        Arc::new(FinalizeResourceStep::new(self.services.resources.clone()))
    }

    fn failure_handler(&self) -> Arc<ResourceFailureHandler> {
        Arc::new(ResourceFailureHandler::new(self.services.resources.clone()))
    }

    fn pipeline_name(plugin: &Arc<dyn ResourcePlugin>, operation: Operation) -> String {
        format!("{}.{}", plugin.resource_type(), operation)
    }

    pub fn create_pipeline(&self, plugin: &Arc<dyn ResourcePlugin>) -> Pipeline {
        Pipeline::builder(Self::pipeline_name(plugin, Operation::Create))
            .pre(self.enter(ResourceEvent::Build))
            .step(Arc::new(ApplyTagsStep::new(self.services.gateway.clone())))
            .step(self.hook(plugin, PluginHook::Create))
            .step(self.hook(plugin, PluginHook::PostCreate))
            .steps(plugin.extra_steps(Operation::Create))
            .post(self.finalize())
            .on_failure(self.failure_handler())
            .build()
    }

    pub fn import_pipeline(&self, plugin: &Arc<dyn ResourcePlugin>) -> Pipeline {
        Pipeline::builder(Self::pipeline_name(plugin, Operation::Import))
            .pre(self.enter(ResourceEvent::Build))
            .step(Arc::new(ApplyTagsStep::new(self.services.gateway.clone())))
            .step(self.hook(plugin, PluginHook::Import))
            .step(self.hook(plugin, PluginHook::PostImport))
            .steps(plugin.extra_steps(Operation::Import))
            .post(self.finalize())
            .on_failure(self.failure_handler())
            .build()
    }

    /// Update, patch and action share the `UPDATING → ACTIVE` shape
    pub fn mutation_pipeline(
        &self,
        plugin: &Arc<dyn ResourcePlugin>,
        operation: Operation,
    ) -> Pipeline {
        let hook = match operation {
            Operation::Patch => PluginHook::Patch,
            Operation::Action => PluginHook::Action,
            _ => PluginHook::Update,
        };
        Pipeline::builder(Self::pipeline_name(plugin, operation))
            .pre(self.enter(ResourceEvent::Update))
            .step(self.hook(plugin, hook))
            .steps(plugin.extra_steps(operation))
            .post(self.finalize())
            .on_failure(self.failure_handler())
            .build()
    }

    pub fn delete_pipeline(self: &Arc<Self>, plugin: &Arc<dyn ResourcePlugin>, force: bool) -> Pipeline {
        let mut builder = Pipeline::builder(Self::pipeline_name(plugin, Operation::Delete));
        if force {
            builder = builder
                .step(Arc::new(EnterResourceStateStep::cascading(
                    self.services.resources.clone(),
                    ResourceEvent::Delete,
                )))
                .step(self.cascade_step());
        } else {
            builder = builder.step(self.enter(ResourceEvent::Delete));
        }
        if plugin.deletable().is_some() {
            builder = builder.step(self.hook(plugin, PluginHook::Delete));
        }
        builder
            .steps(plugin.extra_steps(Operation::Delete))
            .post(Arc::new(SoftDeleteStep::new(self.services.resources.clone())))
            .on_failure(self.failure_handler())
            .build()
    }

    pub fn expunge_pipeline(self: &Arc<Self>, plugin: &Arc<dyn ResourcePlugin>, force: bool) -> Pipeline {
        let mut builder = Pipeline::builder(Self::pipeline_name(plugin, Operation::Expunge))
            .step(self.enter(ResourceEvent::Expunge { force }));
        if force {
            builder = builder.step(self.cascade_step());
        }
        if plugin.deletable().is_some() {
            builder = builder.step(self.hook(plugin, PluginHook::Expunge));
        }
        builder
            .steps(plugin.extra_steps(Operation::Expunge))
            .post(Arc::new(ExpungeResourceStep::new(
                self.services.resources.clone(),
                self.services.graph.clone(),
            )))
            .on_failure(self.failure_handler())
            .build()
    }

    fn cascade_step(self: &Arc<Self>) -> Arc<dyn Step> {
        Arc::new(ExpungeChildrenStep {
            assembler: self.clone(),
        })
    }

    /// Force-expunge one resource and everything below it, children first. Runs inline;
    /// the cascade step of the forced pipeline recurses into the children.
    pub fn expunge_subtree(self: &Arc<Self>, resource: Resource) -> BoxFuture<'_, CoreResult<()>> {
        Box::pin(async move {
            let plugin = self.registry.get(&resource.resource_type)?;
            let pipeline = self.expunge_pipeline(&plugin, true);
            let ctx = context_for(Operation::Expunge, &resource).with_force(true);
            pipeline.execute(ctx, &self.retry, &|_| {}).await?;
            Ok(())
        })
    }

    /// Force-expunge every child (and their subtrees) of a resource
    pub async fn expunge_children(self: &Arc<Self>, resource_id: i64) -> CoreResult<usize> {
        let children = self
            .services
            .gateway
            .list_resources(&ResourceFilter::children_of(resource_id), Pagination::unbounded())
            .await?
            .items;
        let count = children.len();
        for child in children {
            self.expunge_subtree(child).await?;
        }
        if count > 0 {
            info!(resource_id, children = count, "Cascaded expunge below resource");
        }
        Ok(count)
    }

    /// Force-expunge every top-level resource of a container
    pub async fn expunge_container_resources(self: &Arc<Self>, container_id: i64) -> CoreResult<usize> {
        let filter = ResourceFilter::by_container(container_id).including_deleted();
        let resources = self
            .services
            .gateway
            .list_resources(&filter, Pagination::unbounded())
            .await?
            .items;

        let top_level: Vec<_> = resources.into_iter().filter(|r| r.parent_id.is_none()).collect();
        let count = top_level.len();
        for resource in top_level {
            self.expunge_subtree(resource).await?;
        }
        Ok(count)
    }
}

/// Context for an operation against an existing resource
pub fn context_for(operation: Operation, resource: &Resource) -> OperationContext {
    let mut ctx = OperationContext::new(operation, &resource.resource_type, resource.container_id)
        .with_resource(resource.id, resource.uuid)
        .with_name(&resource.name)
        .with_desc(&resource.desc)
        .with_parent(resource.parent_id);
    ctx.objid = Some(resource.objid.clone());
    if resource.has_ext_id() {
        ctx.ext_id = Some(resource.ext_id.clone());
    }
    ctx.attribute = resource.attribute.clone();
    ctx
}

/// Cascade step of forced delete/expunge
struct ExpungeChildrenStep {
    assembler: Arc<PipelineAssembler>,
}

#[async_trait]
impl Step for ExpungeChildrenStep {
    fn name(&self) -> &str {
        "expunge_children"
    }

    async fn run(&self, mut ctx: OperationContext) -> CoreResult<OperationContext> {
        let resource_id = ctx.require_resource_id()?;
        // the parent may already be gone when a cascade is re-run
        if let Err(err) = self
            .assembler
            .services
            .resources
            .get(&EntityKey::Id(resource_id), false)
            .await
        {
            return if err.is_not_found() { Ok(ctx) } else { Err(err) };
        }
        let removed = self.assembler.expunge_children(resource_id).await?;
        ctx.record_progress(format!("expunged {removed} children"));
        Ok(ctx)
    }
}
