//! # In-Memory Gateway
//!
//! Process-local [`PersistenceGateway`] used by embedded deployments and the test
//! suite. All tables live behind a single `RwLock`, so every trait call is one critical
//! section: compare-and-swap state writes and multi-row removals are atomic exactly as
//! they are in the SQL gateway.

use super::gateway::{
    GatewayError, GatewayResult, LinkedResourceFilter, PaginatedResult, Pagination,
    PersistenceGateway,
};
use crate::models::{
    Container, ContainerFilter, ContainerUpdate, EntityKey, Job, JobFilter, LinkDirection,
    LinkFilter, LinkedResource, NewContainer, NewJob, NewResource, NewResourceLink, Resource,
    ResourceFilter, ResourceLink, ResourceTag, ResourceUpdate, TagTarget,
};
use crate::state_machine::{ContainerState, ResourceState};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    containers: BTreeMap<i64, Container>,
    resources: BTreeMap<i64, Resource>,
    links: BTreeMap<i64, ResourceLink>,
    tags: BTreeMap<i64, ResourceTag>,
    tag_assignments: BTreeSet<(TagTarget, i64)>,
    jobs: BTreeMap<i64, Job>,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn container(&self, key: &EntityKey) -> GatewayResult<&Container> {
        match key {
            EntityKey::Id(id) => self.containers.get(id),
            EntityKey::Uuid(uuid) => self.containers.values().find(|c| c.uuid == *uuid),
            EntityKey::Name(name) => self.containers.values().find(|c| c.name == *name),
        }
        .ok_or_else(|| GatewayError::not_found("container", key))
    }

    fn container_mut(&mut self, id: i64) -> GatewayResult<&mut Container> {
        self.containers
            .get_mut(&id)
            .ok_or_else(|| GatewayError::not_found("container", id))
    }

    fn resource(&self, key: &EntityKey) -> GatewayResult<&Resource> {
        match key {
            EntityKey::Id(id) => self.resources.get(id),
            EntityKey::Uuid(uuid) => self.resources.values().find(|r| r.uuid == *uuid),
            EntityKey::Name(name) => self.resources.values().find(|r| r.name == *name),
        }
        .ok_or_else(|| GatewayError::not_found("resource", key))
    }

    fn resource_mut(&mut self, id: i64) -> GatewayResult<&mut Resource> {
        self.resources
            .get_mut(&id)
            .ok_or_else(|| GatewayError::not_found("resource", id))
    }

    fn link(&self, key: &EntityKey) -> GatewayResult<&ResourceLink> {
        match key {
            EntityKey::Id(id) => self.links.get(id),
            EntityKey::Uuid(uuid) => self.links.values().find(|l| l.uuid == *uuid),
            EntityKey::Name(name) => self.links.values().find(|l| l.name == *name),
        }
        .ok_or_else(|| GatewayError::not_found("link", key))
    }
}

/// In-memory persistence gateway
#[derive(Debug, Default)]
pub struct MemoryGateway {
    tables: RwLock<Tables>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

fn state_names<S: ToString>(states: &[S]) -> Vec<String> {
    states.iter().map(ToString::to_string).collect()
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn add_container(&self, new: NewContainer) -> GatewayResult<Container> {
        let mut tables = self.tables.write();
        let id = tables.allocate_id();
        let now = Utc::now();
        let container = Container {
            id,
            uuid: Uuid::new_v4(),
            objid: new.objid,
            name: new.name,
            desc: new.desc,
            category: new.category,
            container_type: new.container_type,
            implementation_class: new.implementation_class,
            connection: new.connection,
            state: ContainerState::Pending,
            active: false,
            last_error: String::new(),
            created_at: now,
            updated_at: now,
            expiry_date: None,
        };
        tables.containers.insert(id, container.clone());
        Ok(container)
    }

    async fn get_container(&self, key: &EntityKey) -> GatewayResult<Container> {
        self.tables.read().container(key).cloned()
    }

    async fn list_containers(
        &self,
        filter: &ContainerFilter,
        page: Pagination,
    ) -> GatewayResult<PaginatedResult<Container>> {
        let tables = self.tables.read();
        let items = tables
            .containers
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        Ok(page.apply(items))
    }

    async fn update_container(
        &self,
        id: i64,
        update: ContainerUpdate,
    ) -> GatewayResult<Container> {
        let mut tables = self.tables.write();
        let container = tables.container_mut(id)?;
        if let Some(name) = update.name {
            container.name = name;
        }
        if let Some(desc) = update.desc {
            container.desc = desc;
        }
        if let Some(connection) = update.connection {
            container.connection = connection;
        }
        if let Some(active) = update.active {
            container.active = active;
        }
        container.updated_at = Utc::now();
        Ok(container.clone())
    }

    async fn set_container_state(
        &self,
        id: i64,
        state: ContainerState,
        last_error: Option<String>,
    ) -> GatewayResult<Container> {
        let mut tables = self.tables.write();
        let container = tables.container_mut(id)?;
        container.state = state;
        if let Some(last_error) = last_error {
            container.last_error = last_error;
        }
        container.updated_at = Utc::now();
        Ok(container.clone())
    }

    async fn transition_container_state(
        &self,
        id: i64,
        allowed_from: &[ContainerState],
        to: ContainerState,
    ) -> GatewayResult<Container> {
        let mut tables = self.tables.write();
        let container = tables.container_mut(id)?;
        if !allowed_from.contains(&container.state) {
            return Err(GatewayError::StateConflict {
                entity: "container",
                id,
                current: container.state.to_string(),
                expected: state_names(allowed_from),
            });
        }
        container.state = to;
        container.updated_at = Utc::now();
        Ok(container.clone())
    }

    async fn remove_container(&self, id: i64) -> GatewayResult<()> {
        let mut tables = self.tables.write();
        if tables.resources.values().any(|r| r.container_id == id) {
            return Err(GatewayError::Constraint(format!(
                "container {id} still owns resources"
            )));
        }
        tables
            .containers
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| GatewayError::not_found("container", id))
    }

    async fn add_resource(&self, new: NewResource) -> GatewayResult<Resource> {
        let mut tables = self.tables.write();
        if !tables.containers.contains_key(&new.container_id) {
            return Err(GatewayError::Constraint(format!(
                "container {} does not exist",
                new.container_id
            )));
        }
        if let Some(parent_id) = new.parent_id {
            if !tables.resources.contains_key(&parent_id) {
                return Err(GatewayError::Constraint(format!(
                    "parent resource {parent_id} does not exist"
                )));
            }
        }
        let id = tables.allocate_id();
        let now = Utc::now();
        let resource = Resource {
            id,
            uuid: Uuid::new_v4(),
            objid: new.objid,
            name: new.name,
            desc: new.desc,
            resource_type: new.resource_type,
            implementation_class: new.implementation_class,
            container_id: new.container_id,
            parent_id: new.parent_id,
            ext_id: new.ext_id,
            state: new.state,
            active: new.active,
            attribute: new.attribute,
            last_error: String::new(),
            created_at: now,
            updated_at: now,
            expiry_date: None,
        };
        tables.resources.insert(id, resource.clone());
        Ok(resource)
    }

    async fn get_resource(&self, key: &EntityKey) -> GatewayResult<Resource> {
        self.tables.read().resource(key).cloned()
    }

    async fn get_resource_by_ext_id(
        &self,
        container_id: i64,
        ext_id: &str,
    ) -> GatewayResult<Resource> {
        self.tables
            .read()
            .resources
            .values()
            .find(|r| r.container_id == container_id && r.ext_id == ext_id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found("resource", ext_id))
    }

    async fn list_resources(
        &self,
        filter: &ResourceFilter,
        page: Pagination,
    ) -> GatewayResult<PaginatedResult<Resource>> {
        let tables = self.tables.read();
        let items = tables
            .resources
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        Ok(page.apply(items))
    }

    async fn count_resources(&self, filter: &ResourceFilter) -> GatewayResult<u64> {
        let tables = self.tables.read();
        Ok(tables.resources.values().filter(|r| filter.matches(r)).count() as u64)
    }

    async fn update_resource(&self, id: i64, update: ResourceUpdate) -> GatewayResult<Resource> {
        let mut tables = self.tables.write();
        let resource = tables.resource_mut(id)?;
        if let Some(name) = update.name {
            resource.name = name;
        }
        if let Some(desc) = update.desc {
            resource.desc = desc;
        }
        if let Some(ext_id) = update.ext_id {
            resource.ext_id = ext_id;
        }
        if let Some(attribute) = update.attribute {
            resource.attribute = attribute;
        }
        if let Some(active) = update.active {
            resource.active = active;
        }
        resource.updated_at = Utc::now();
        Ok(resource.clone())
    }

    async fn set_resource_state(
        &self,
        id: i64,
        state: ResourceState,
        last_error: Option<String>,
    ) -> GatewayResult<Resource> {
        let mut tables = self.tables.write();
        let resource = tables.resource_mut(id)?;
        resource.state = state;
        if let Some(last_error) = last_error {
            resource.last_error = last_error;
        }
        resource.updated_at = Utc::now();
        Ok(resource.clone())
    }

    async fn transition_resource_state(
        &self,
        id: i64,
        allowed_from: &[ResourceState],
        to: ResourceState,
    ) -> GatewayResult<Resource> {
        let mut tables = self.tables.write();
        let resource = tables.resource_mut(id)?;
        if !allowed_from.contains(&resource.state) {
            return Err(GatewayError::StateConflict {
                entity: "resource",
                id,
                current: resource.state.to_string(),
                expected: state_names(allowed_from),
            });
        }
        resource.state = to;
        resource.updated_at = Utc::now();
        Ok(resource.clone())
    }

    async fn soft_delete_resource(&self, id: i64) -> GatewayResult<Resource> {
        let mut tables = self.tables.write();
        let resource = tables.resource_mut(id)?;
        let now = Utc::now();
        resource.state = ResourceState::Deleted;
        resource.active = false;
        resource.expiry_date = Some(now);
        resource.updated_at = now;
        Ok(resource.clone())
    }

    async fn remove_resource(&self, id: i64) -> GatewayResult<()> {
        let mut tables = self.tables.write();
        if tables.links.values().any(|l| l.touches(id)) {
            return Err(GatewayError::Constraint(format!(
                "resource {id} is still referenced by links"
            )));
        }
        if tables.resources.values().any(|r| r.parent_id == Some(id)) {
            return Err(GatewayError::Constraint(format!(
                "resource {id} still has children"
            )));
        }
        tables
            .resources
            .remove(&id)
            .ok_or_else(|| GatewayError::not_found("resource", id))?;
        tables
            .tag_assignments
            .retain(|(target, _)| *target != TagTarget::Resource(id));
        Ok(())
    }

    async fn add_link(&self, new: NewResourceLink) -> GatewayResult<ResourceLink> {
        let mut tables = self.tables.write();
        for endpoint in [new.start_resource_id, new.end_resource_id] {
            if !tables.resources.contains_key(&endpoint) {
                return Err(GatewayError::Constraint(format!(
                    "link endpoint {endpoint} does not exist"
                )));
            }
        }
        let id = tables.allocate_id();
        let now = Utc::now();
        let link = ResourceLink {
            id,
            uuid: Uuid::new_v4(),
            objid: new.objid,
            name: new.name,
            link_type: new.link_type,
            start_resource_id: new.start_resource_id,
            end_resource_id: new.end_resource_id,
            attributes: new.attributes,
            created_at: now,
            updated_at: now,
        };
        tables.links.insert(id, link.clone());
        Ok(link)
    }

    async fn get_link(&self, key: &EntityKey) -> GatewayResult<ResourceLink> {
        self.tables.read().link(key).cloned()
    }

    async fn list_links(
        &self,
        filter: &LinkFilter,
        page: Pagination,
    ) -> GatewayResult<PaginatedResult<ResourceLink>> {
        let tables = self.tables.read();
        let items = tables
            .links
            .values()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect();
        Ok(page.apply(items))
    }

    async fn update_link_attributes(
        &self,
        id: i64,
        attributes: Value,
    ) -> GatewayResult<ResourceLink> {
        let mut tables = self.tables.write();
        let link = tables
            .links
            .get_mut(&id)
            .ok_or_else(|| GatewayError::not_found("link", id))?;
        link.attributes = attributes;
        link.updated_at = Utc::now();
        Ok(link.clone())
    }

    async fn remove_link(&self, id: i64) -> GatewayResult<()> {
        let mut tables = self.tables.write();
        tables
            .links
            .remove(&id)
            .ok_or_else(|| GatewayError::not_found("link", id))?;
        tables
            .tag_assignments
            .retain(|(target, _)| *target != TagTarget::Link(id));
        Ok(())
    }

    async fn remove_links(&self, filter: &LinkFilter) -> GatewayResult<u64> {
        let mut tables = self.tables.write();
        let doomed: Vec<i64> = tables
            .links
            .values()
            .filter(|l| filter.matches(l))
            .map(|l| l.id)
            .collect();
        for id in &doomed {
            tables.links.remove(id);
        }
        tables
            .tag_assignments
            .retain(|(target, _)| !matches!(target, TagTarget::Link(id) if doomed.contains(id)));
        Ok(doomed.len() as u64)
    }

    async fn list_linked_resources(
        &self,
        filter: &LinkedResourceFilter,
        page: Pagination,
    ) -> GatewayResult<PaginatedResult<LinkedResource>> {
        let tables = self.tables.read();
        let mut items = Vec::new();
        for link in tables.links.values() {
            if filter
                .link_type
                .as_ref()
                .is_some_and(|t| *t != link.link_type)
            {
                continue;
            }
            let mut hops = Vec::with_capacity(2);
            if matches!(filter.direction, LinkDirection::Outgoing | LinkDirection::Both)
                && filter.origin_ids.contains(&link.start_resource_id)
            {
                hops.push((link.start_resource_id, link.end_resource_id));
            }
            if matches!(filter.direction, LinkDirection::Incoming | LinkDirection::Both)
                && filter.origin_ids.contains(&link.end_resource_id)
            {
                hops.push((link.end_resource_id, link.start_resource_id));
            }
            for (origin_id, other_id) in hops {
                let Some(resource) = tables.resources.get(&other_id) else {
                    continue;
                };
                if !filter.resource_types.is_empty()
                    && !filter.resource_types.contains(&resource.resource_type)
                {
                    continue;
                }
                items.push(LinkedResource {
                    link: link.clone(),
                    origin_id,
                    resource: resource.clone(),
                });
            }
        }
        Ok(page.apply(items))
    }

    async fn add_tag(&self, value: &str) -> GatewayResult<ResourceTag> {
        let mut tables = self.tables.write();
        if let Some(tag) = tables.tags.values().find(|t| t.value == value) {
            return Ok(tag.clone());
        }
        let id = tables.allocate_id();
        let tag = ResourceTag {
            id,
            value: value.to_string(),
            created_at: Utc::now(),
        };
        tables.tags.insert(id, tag.clone());
        Ok(tag)
    }

    async fn attach_tag(&self, target: TagTarget, tag_id: i64) -> GatewayResult<bool> {
        let mut tables = self.tables.write();
        if !tables.tags.contains_key(&tag_id) {
            return Err(GatewayError::not_found("tag", tag_id));
        }
        let target_exists = match target {
            TagTarget::Resource(id) => tables.resources.contains_key(&id),
            TagTarget::Link(id) => tables.links.contains_key(&id),
        };
        if !target_exists {
            return Err(GatewayError::Constraint(format!(
                "tag target {target:?} does not exist"
            )));
        }
        Ok(tables.tag_assignments.insert((target, tag_id)))
    }

    async fn detach_tag(&self, target: TagTarget, tag_id: i64) -> GatewayResult<bool> {
        Ok(self.tables.write().tag_assignments.remove(&(target, tag_id)))
    }

    async fn list_tags(&self, target: TagTarget) -> GatewayResult<Vec<ResourceTag>> {
        let tables = self.tables.read();
        Ok(tables
            .tag_assignments
            .iter()
            .filter(|(t, _)| *t == target)
            .filter_map(|(_, tag_id)| tables.tags.get(tag_id).cloned())
            .collect())
    }

    async fn add_job(&self, new: NewJob) -> GatewayResult<Job> {
        let mut tables = self.tables.write();
        let id = tables.allocate_id();
        let job = Job {
            id,
            job_id: new.job_id,
            name: new.name,
            resource_id: new.resource_id,
            container_id: new.container_id,
            params: new.params,
            created_at: Utc::now(),
        };
        tables.jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: &str) -> GatewayResult<Job> {
        self.tables
            .read()
            .jobs
            .values()
            .find(|j| j.job_id == job_id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found("job", job_id))
    }

    async fn list_jobs(
        &self,
        filter: &JobFilter,
        page: Pagination,
    ) -> GatewayResult<PaginatedResult<Job>> {
        let tables = self.tables.read();
        let items = tables
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        Ok(page.apply(items))
    }
}
