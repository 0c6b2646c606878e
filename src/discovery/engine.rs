//! # Reconciliation Engine
//!
//! Aligns local inventory with what a remote platform reports.
//!
//! - **new**: remote entities whose `ext_id` is not tracked locally. They are inserted
//!   straight into `ACTIVE`, parents before children, without running a create pipeline.
//! - **died**: local resources, soft-deleted ones included, with an `ext_id` the remote
//!   inventory no longer lists. They are expunged together with their links, deepest
//!   first.
//! - **changed**: local resources whose remote name differs. They go through
//!   `UPDATING → ACTIVE` with the remote name and attributes.
//!
//! A container run orders both passes across all requested types, not per type.
//!
//! One entity failing never stops the run: the error is logged, recorded in the
//! [`ReconciliationReport`] and the engine moves on. A second run against an unchanged
//! remote inventory finds nothing to do.

use super::report::{ReconciledEntity, ReconciliationReport, SyncOptions, SyncRequest};
use crate::auth::{operations, Authorizer};
use crate::config::ReconciliationConfig;
use crate::constants::{events, objtype};
use crate::error::{CoreError, CoreResult};
use crate::logging::log_reconciliation;
use crate::models::{
    merge_attribute, objid, Container, EntityKey, NewJob, NewResource, Resource, ResourceFilter,
    ResourceUpdate,
};
use crate::orchestration::{
    CompleteContainerStep, ContainerFailureHandler, CoreServices, EnterContainerStateStep,
    Operation, OperationContext, Pipeline, Step, TaskExecutor,
};
use crate::persistence::Pagination;
use crate::plugin::{DiscoveredEntity, Discoverable, RemoteEntity, ResourcePlugin, SyncedResource};
use crate::registry::ResourceTypeRegistry;
use crate::state_machine::{ContainerEvent, ContainerStateMachine, ResourceEvent, ResourceState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Result of [`ReconciliationEngine::synchronize_resources`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed { report: ReconciliationReport },
    Submitted { task_id: String },
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    services: CoreServices,
    registry: Arc<ResourceTypeRegistry>,
    executor: Arc<dyn TaskExecutor>,
    authorizer: Arc<dyn Authorizer>,
    config: ReconciliationConfig,
}

impl ReconciliationEngine {
    pub fn new(
        services: CoreServices,
        registry: Arc<ResourceTypeRegistry>,
        executor: Arc<dyn TaskExecutor>,
        authorizer: Arc<dyn Authorizer>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            services,
            registry,
            executor,
            authorizer,
            config,
        }
    }

    fn discoverable_plugin(
        &self,
        container: &Container,
        resource_type: &str,
    ) -> CoreResult<Arc<dyn ResourcePlugin>> {
        let plugin = self.registry.get(resource_type)?;
        if plugin.container_type() != container.container_type {
            return Err(CoreError::Validation(format!(
                "{resource_type} does not belong to {} containers",
                container.container_type
            )));
        }
        if plugin.discoverable().is_none() {
            return Err(CoreError::Validation(format!(
                "{resource_type} does not support discovery"
            )));
        }
        Ok(plugin)
    }

    /// Insert every remote entity of `resource_type` not yet tracked locally
    #[instrument(skip(self, container), fields(container_id = container.id))]
    pub async fn discover_new_entities(
        &self,
        container: &Container,
        resource_type: &str,
        ext_id_hint: Option<&str>,
    ) -> CoreResult<ReconciliationReport> {
        let mut known = self.known_ext_ids(container.id).await?;
        let discovered = self
            .list_new(container, resource_type, ext_id_hint, &known)
            .await?;
        let mut report = ReconciliationReport::default();
        self.insert_batch(container, discovered, &mut known, &mut report)
            .await;
        Ok(report)
    }

    /// New-entity pass over several types at once. Entities from every type are
    /// inserted in one batch ordered by `level`, so a parent whose type is listed after
    /// its child's still goes in first. A type whose listing fails is recorded and
    /// skipped.
    pub async fn discover_new_across(
        &self,
        container: &Container,
        resource_types: &[String],
        ext_id_hint: Option<&str>,
    ) -> CoreResult<ReconciliationReport> {
        let mut known = self.known_ext_ids(container.id).await?;
        let mut report = ReconciliationReport::default();
        let mut discovered = Vec::new();
        for resource_type in resource_types {
            match self
                .list_new(container, resource_type, ext_id_hint, &known)
                .await
            {
                Ok(entities) => discovered.extend(entities),
                Err(err) => {
                    warn!(resource_type = %resource_type, error = %err, "Listing new entities failed");
                    report.record_error(resource_type, "*", err);
                }
            }
        }
        self.insert_batch(container, discovered, &mut known, &mut report)
            .await;
        Ok(report)
    }

    async fn list_new(
        &self,
        container: &Container,
        resource_type: &str,
        ext_id_hint: Option<&str>,
        known: &HashSet<String>,
    ) -> CoreResult<Vec<DiscoveredEntity>> {
        let plugin = self.discoverable_plugin(container, resource_type)?;
        let discoverable = discoverable_of(plugin.as_ref())?;
        let session = self.services.sessions.get_or_open(container).await?;

        let mut discovered = discoverable
            .discover_new(&session, ext_id_hint, known)
            .await?;
        discovered.retain(|entity| !entity.ext_id.is_empty() && !known.contains(&entity.ext_id));
        Ok(discovered)
    }

    /// Insert parents before children. An entity whose parent is part of the same batch
    /// but not inserted yet is retried on the next pass; passes stop once one makes no
    /// progress.
    async fn insert_batch(
        &self,
        container: &Container,
        mut discovered: Vec<DiscoveredEntity>,
        known: &mut HashSet<String>,
        report: &mut ReconciliationReport,
    ) {
        discovered.sort_by_key(|entity| entity.level);
        discovered.retain(|entity| known.insert(entity.ext_id.clone()));

        let mut pending = discovered;
        while !pending.is_empty() {
            let in_batch: HashSet<String> =
                pending.iter().map(|entity| entity.ext_id.clone()).collect();
            let mut deferred = Vec::new();
            let mut inserted = 0;
            for entity in pending {
                match self.insert_discovered(container, &entity).await {
                    Ok(resource) => {
                        inserted += 1;
                        report.new.push(reconciled(&resource));
                    }
                    Err(err)
                        if err.is_not_found()
                            && entity
                                .parent_ext_id
                                .as_ref()
                                .is_some_and(|parent| in_batch.contains(parent)) =>
                    {
                        deferred.push((entity, err));
                    }
                    Err(err) => skip_discovered(container, &entity, err, report),
                }
            }
            if inserted == 0 {
                for (entity, err) in deferred {
                    skip_discovered(container, &entity, err, report);
                }
                break;
            }
            pending = deferred.into_iter().map(|(entity, _)| entity).collect();
        }
    }

    /// Compare local resources of `resource_type` with the remote inventory. `died` and
    /// `changed` toggle the two classifications independently.
    #[instrument(skip(self, container), fields(container_id = container.id))]
    pub async fn discover_died_entities(
        &self,
        container: &Container,
        resource_type: &str,
        died: bool,
        changed: bool,
    ) -> CoreResult<ReconciliationReport> {
        let mut report = ReconciliationReport::default();
        if !died && !changed {
            return Ok(report);
        }
        let mut dead = Vec::new();
        self.classify_local(container, resource_type, died, changed, &mut dead, &mut report)
            .await?;
        self.expunge_dead(dead, &mut report).await;
        Ok(report)
    }

    /// Died/changed pass over several types at once. The died resources of every type
    /// are expunged as one list, deepest first, so a child whose type is listed after
    /// its parent's is gone before the parent is tried.
    pub async fn discover_died_across(
        &self,
        container: &Container,
        resource_types: &[String],
        died: bool,
        changed: bool,
    ) -> CoreResult<ReconciliationReport> {
        let mut report = ReconciliationReport::default();
        if !died && !changed {
            return Ok(report);
        }
        let mut dead = Vec::new();
        for resource_type in resource_types {
            if let Err(err) = self
                .classify_local(container, resource_type, died, changed, &mut dead, &mut report)
                .await
            {
                warn!(resource_type = %resource_type, error = %err, "Listing remote inventory failed");
                report.record_error(resource_type, "*", err);
            }
        }
        self.expunge_dead(dead, &mut report).await;
        Ok(report)
    }

    /// Apply remote renames right away and collect the resources the remote no longer
    /// lists into `dead`. Soft-deleted rows count as died but are never renamed.
    async fn classify_local(
        &self,
        container: &Container,
        resource_type: &str,
        died: bool,
        changed: bool,
        dead: &mut Vec<Resource>,
        report: &mut ReconciliationReport,
    ) -> CoreResult<()> {
        let plugin = self.discoverable_plugin(container, resource_type)?;
        let discoverable = discoverable_of(plugin.as_ref())?;
        let session = self.services.sessions.get_or_open(container).await?;

        let inventory = discoverable.discover_died(&session).await?;
        let remote: HashMap<&str, &RemoteEntity> = inventory
            .iter()
            .map(|entity| (entity.ext_id.as_str(), entity))
            .collect();

        for resource in self.local_resources(container.id, resource_type).await? {
            if !resource.has_ext_id() {
                continue;
            }
            match remote.get(resource.ext_id.as_str()) {
                None if died => dead.push(resource),
                Some(entity)
                    if changed && !resource.is_soft_deleted() && entity.name != resource.name =>
                {
                    match self.apply_remote_change(&resource, entity).await {
                        Ok(updated) => report.changed.push(reconciled(&updated)),
                        Err(err) => {
                            warn!(resource_id = resource.id, error = %err, "Skipping changed resource");
                            report.record_error(resource_type, &resource.ext_id, err);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn expunge_dead(&self, mut dead: Vec<Resource>, report: &mut ReconciliationReport) {
        // children before parents
        dead.sort_by_key(|resource| Reverse(objid::segments(&resource.objid).len()));
        for resource in dead {
            match self.expunge_died(&resource).await {
                Ok(()) => report.died.push(reconciled(&resource)),
                Err(err) => {
                    warn!(resource_id = resource.id, error = %err, "Skipping died resource");
                    report.record_error(&resource.resource_type, &resource.ext_id, err);
                }
            }
        }
    }

    /// Container-level entry point: runs new/died/changed detection for each requested
    /// type as one pipeline holding the container in `SYNCHRONIZE`
    #[instrument(skip(self, request))]
    pub async fn synchronize_resources(
        &self,
        container: &EntityKey,
        request: SyncRequest,
    ) -> CoreResult<SyncOutcome> {
        let container = self.services.containers.get(container, false).await?;
        self.authorizer
            .check_authorization(
                objtype::CONTAINER,
                &container.container_type,
                &container.objid,
                operations::USE,
            )
            .await?;

        let resource_types = if request.resource_types.is_empty() {
            self.registry
                .types_for_container(&container.container_type)
                .into_iter()
                .filter(|plugin| plugin.discoverable().is_some())
                .map(|plugin| plugin.resource_type().to_string())
                .collect()
        } else {
            for resource_type in &request.resource_types {
                self.discoverable_plugin(&container, resource_type)?;
            }
            request.resource_types.clone()
        };
        ContainerStateMachine::determine_target_state(&container, &ContainerEvent::Synchronize)?;

        let options = request
            .options
            .unwrap_or_else(|| SyncOptions::from_config(&self.config));
        let mut ctx = OperationContext::new(
            Operation::Synchronize,
            &container.container_type,
            container.id,
        )
        .with_params(json!({
            "resource_types": resource_types,
            "ext_id_hint": request.ext_id_hint,
            "options": options,
        }));
        ctx.objid = Some(container.objid.clone());
        ctx.result = serde_json::to_value(ReconciliationReport::default())?;

        let pipeline = Arc::new(self.sync_pipeline(
            &container,
            &resource_types,
            request.ext_id_hint,
            options,
        ));

        if request.sync {
            let ctx = self.executor.run_inline(&pipeline, ctx).await?;
            let report: ReconciliationReport = serde_json::from_value(ctx.result)?;
            return Ok(SyncOutcome::Completed { report });
        }

        let task_id = self.executor.new_task_id();
        ctx.task_id = Some(task_id.clone());
        self.services
            .gateway
            .add_job(NewJob {
                job_id: task_id.clone(),
                name: pipeline.name().to_string(),
                resource_id: None,
                container_id: Some(container.id),
                params: serde_json::to_value(&ctx)?,
            })
            .await?;
        self.executor.submit(pipeline, ctx).await?;
        Ok(SyncOutcome::Submitted { task_id })
    }

    fn sync_pipeline(
        &self,
        container: &Container,
        resource_types: &[String],
        ext_id_hint: Option<String>,
        options: SyncOptions,
    ) -> Pipeline {
        let mut steps: Vec<Arc<dyn Step>> = Vec::new();
        if options.discover_new {
            steps.push(Arc::new(DiscoverNewStep {
                engine: self.clone(),
                resource_types: resource_types.to_vec(),
                ext_id_hint,
            }));
        }
        if options.discover_died || options.discover_changed {
            steps.push(Arc::new(DiscoverDiedStep {
                engine: self.clone(),
                resource_types: resource_types.to_vec(),
                options,
            }));
        }

        Pipeline::builder(format!("{}.synchronize", container.container_type))
            .pre(Arc::new(EnterContainerStateStep::new(
                self.services.containers.clone(),
                ContainerEvent::Synchronize,
            )))
            .steps(steps)
            .post(Arc::new(FinishReconciliationStep {
                complete: CompleteContainerStep::new(self.services.containers.clone()),
                services: self.services.clone(),
            }))
            .on_failure(Arc::new(ContainerFailureHandler::new(
                self.services.containers.clone(),
            )))
            .build()
    }

    /// Every `ext_id` tracked in the container, soft-deleted rows included
    async fn known_ext_ids(&self, container_id: i64) -> CoreResult<HashSet<String>> {
        let filter = ResourceFilter::by_container(container_id).including_deleted();
        let mut known = HashSet::new();
        let mut offset = 0;
        loop {
            let page = self
                .services
                .gateway
                .list_resources(&filter, Pagination::new(offset, self.config.page_size))
                .await?;
            let fetched = page.items.len() as u64;
            known.extend(
                page.items
                    .into_iter()
                    .filter(|resource| resource.has_ext_id())
                    .map(|resource| resource.ext_id),
            );
            offset += fetched;
            if fetched == 0 || offset >= page.total {
                return Ok(known);
            }
        }
    }

    /// Every row of one type in the container, soft-deleted rows included
    async fn local_resources(
        &self,
        container_id: i64,
        resource_type: &str,
    ) -> CoreResult<Vec<Resource>> {
        let filter = ResourceFilter::by_container(container_id)
            .with_type(resource_type)
            .including_deleted();
        let mut resources = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .services
                .gateway
                .list_resources(&filter, Pagination::new(offset, self.config.page_size))
                .await?;
            let fetched = page.items.len() as u64;
            resources.extend(page.items);
            offset += fetched;
            if fetched == 0 || offset >= page.total {
                return Ok(resources);
            }
        }
    }

    async fn insert_discovered(
        &self,
        container: &Container,
        entity: &DiscoveredEntity,
    ) -> CoreResult<Resource> {
        let owner = self.registry.get(&entity.resource_type)?;
        if owner.container_type() != container.container_type {
            return Err(CoreError::Validation(format!(
                "{} does not belong to {} containers",
                entity.resource_type, container.container_type
            )));
        }
        let synced = match owner.discoverable() {
            Some(discoverable) => discoverable.synchronize(container, entity).await?,
            None => SyncedResource {
                name: entity.name.clone(),
                desc: String::new(),
                ext_id: entity.ext_id.clone(),
                parent_ext_id: entity.parent_ext_id.clone(),
                attribute: json!({}),
            },
        };

        let parent = match &synced.parent_ext_id {
            Some(parent_ext_id) => Some(
                self.services
                    .gateway
                    .get_resource_by_ext_id(container.id, parent_ext_id)
                    .await?,
            ),
            None => None,
        };
        let scope = parent.as_ref().map_or(&container.objid, |p| &p.objid);

        let resource = self
            .services
            .gateway
            .add_resource(NewResource {
                objid: objid::child_of(scope),
                name: synced.name,
                desc: synced.desc,
                resource_type: owner.resource_type().to_string(),
                implementation_class: owner.implementation_class().to_string(),
                container_id: container.id,
                parent_id: parent.map(|p| p.id),
                ext_id: synced.ext_id,
                state: ResourceState::Active,
                active: true,
                attribute: synced.attribute,
            })
            .await?;
        debug!(
            resource_id = resource.id,
            ext_id = %resource.ext_id,
            "Inserted discovered resource"
        );
        Ok(resource)
    }

    async fn apply_remote_change(
        &self,
        resource: &Resource,
        entity: &RemoteEntity,
    ) -> CoreResult<Resource> {
        if !resource.state.is_operable() {
            return Err(CoreError::conflict(
                "resource",
                resource.id,
                format!("state {} is not operable", resource.state),
            ));
        }
        let resources = &self.services.resources;
        resources.transition(resource.id, ResourceEvent::Update).await?;

        let mut attribute = resource.attribute.clone();
        if entity.attributes.is_object() {
            merge_attribute(&mut attribute, &entity.attributes);
        }
        let outcome = async {
            resources
                .update_fields(
                    resource.id,
                    ResourceUpdate {
                        name: Some(entity.name.clone()),
                        attribute: Some(attribute),
                        ..Default::default()
                    },
                )
                .await?;
            resources.transition(resource.id, ResourceEvent::Complete).await
        }
        .await;

        if let Err(err) = &outcome {
            resources
                .update_state(resource.id, ResourceState::Error, Some(err.to_string()))
                .await?;
        }
        outcome
    }

    async fn expunge_died(&self, resource: &Resource) -> CoreResult<()> {
        let children = self
            .services
            .gateway
            .count_resources(&ResourceFilter::children_of(resource.id))
            .await?;
        if children > 0 {
            return Err(CoreError::conflict(
                "resource",
                resource.id,
                format!("{children} children are still tracked"),
            ));
        }

        let resources = &self.services.resources;
        resources
            .transition(resource.id, ResourceEvent::Expunge { force: true })
            .await?;
        let outcome = async {
            self.services.graph.expunge_links_for(resource.id).await?;
            resources.remove(resource.id).await
        }
        .await;

        if let Err(err) = &outcome {
            resources
                .update_state(resource.id, ResourceState::Error, Some(err.to_string()))
                .await?;
        }
        outcome
    }
}

fn discoverable_of(plugin: &dyn ResourcePlugin) -> CoreResult<&dyn Discoverable> {
    plugin.discoverable().ok_or_else(|| {
        CoreError::Validation(format!(
            "{} does not support discovery",
            plugin.resource_type()
        ))
    })
}

fn skip_discovered(
    container: &Container,
    entity: &DiscoveredEntity,
    err: CoreError,
    report: &mut ReconciliationReport,
) {
    warn!(
        container_id = container.id,
        ext_id = %entity.ext_id,
        error = %err,
        "Skipping discovered entity"
    );
    report.record_error(&entity.resource_type, &entity.ext_id, err);
}

fn reconciled(resource: &Resource) -> ReconciledEntity {
    ReconciledEntity {
        resource_type: resource.resource_type.clone(),
        ext_id: resource.ext_id.clone(),
        name: resource.name.clone(),
        resource_id: Some(resource.id),
    }
}

fn report_of(ctx: &OperationContext) -> CoreResult<ReconciliationReport> {
    if ctx.result.is_null() {
        Ok(ReconciliationReport::default())
    } else {
        Ok(serde_json::from_value(ctx.result.clone())?)
    }
}

/// One log line per type with the counts this step found for it
fn log_found(container_id: i64, resource_types: &[String], found: &ReconciliationReport) {
    for resource_type in resource_types {
        let count = |entities: &[ReconciledEntity]| {
            entities
                .iter()
                .filter(|entity| &entity.resource_type == resource_type)
                .count()
        };
        log_reconciliation(
            container_id,
            resource_type,
            count(&found.new),
            count(&found.died),
            count(&found.changed),
            found
                .errors
                .iter()
                .filter(|failure| &failure.resource_type == resource_type)
                .count(),
        );
    }
}

/// Inserts the new entities of every requested type and folds them into `ctx.result`
struct DiscoverNewStep {
    engine: ReconciliationEngine,
    resource_types: Vec<String>,
    ext_id_hint: Option<String>,
}

#[async_trait]
impl Step for DiscoverNewStep {
    fn name(&self) -> &str {
        "discover_new"
    }

    async fn run(&self, mut ctx: OperationContext) -> CoreResult<OperationContext> {
        let container = self
            .engine
            .services
            .containers
            .get(&EntityKey::Id(ctx.container_id), false)
            .await?;
        let mut report = report_of(&ctx)?;
        let found = self
            .engine
            .discover_new_across(&container, &self.resource_types, self.ext_id_hint.as_deref())
            .await?;
        log_found(container.id, &self.resource_types, &found);
        report.merge(found);
        ctx.result = serde_json::to_value(&report)?;
        Ok(ctx)
    }
}

/// Expunges died resources and applies remote changes across every requested type
struct DiscoverDiedStep {
    engine: ReconciliationEngine,
    resource_types: Vec<String>,
    options: SyncOptions,
}

#[async_trait]
impl Step for DiscoverDiedStep {
    fn name(&self) -> &str {
        "discover_died"
    }

    async fn run(&self, mut ctx: OperationContext) -> CoreResult<OperationContext> {
        let container = self
            .engine
            .services
            .containers
            .get(&EntityKey::Id(ctx.container_id), false)
            .await?;
        let mut report = report_of(&ctx)?;
        let found = self
            .engine
            .discover_died_across(
                &container,
                &self.resource_types,
                self.options.discover_died,
                self.options.discover_changed,
            )
            .await?;
        log_found(container.id, &self.resource_types, &found);
        report.merge(found);
        ctx.result = serde_json::to_value(&report)?;
        Ok(ctx)
    }
}

/// Post-step: releases the container and announces the report
struct FinishReconciliationStep {
    complete: CompleteContainerStep,
    services: CoreServices,
}

#[async_trait]
impl Step for FinishReconciliationStep {
    fn name(&self) -> &str {
        "finish_reconciliation"
    }

    async fn run(&self, ctx: OperationContext) -> CoreResult<OperationContext> {
        let ctx = self.complete.run(ctx).await?;
        if let Err(err) = self
            .services
            .events
            .publish(
                events::RECONCILIATION_COMPLETED,
                json!({"container_id": ctx.container_id, "report": ctx.result}),
            )
            .await
        {
            warn!(container_id = ctx.container_id, error = %err, "Failed to publish reconciliation event");
        }
        Ok(ctx)
    }
}
