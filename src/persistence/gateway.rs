//! # Persistence Gateway
//!
//! Narrow storage contract the control plane is written against. Implementations treat
//! every call as one atomic unit; in particular the `transition_*_state` calls are
//! compare-and-swap writes that close the race between checking a resource's state and
//! moving it into an in-progress state.
//!
//! All list calls are paginated and return `(items, total)` via [`PaginatedResult`].

use crate::models::{
    Container, ContainerFilter, ContainerUpdate, EntityKey, Job, JobFilter, LinkDirection,
    LinkFilter, LinkedResource, NewContainer, NewJob, NewResource, NewResourceLink, Resource,
    ResourceFilter, ResourceLink, ResourceTag, ResourceUpdate, TagTarget,
};
use crate::state_machine::{ContainerState, ResourceState};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Pagination parameters for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub offset: u64,
    pub limit: u64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

impl Pagination {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }

    /// Everything in one page
    pub fn unbounded() -> Self {
        Self {
            offset: 0,
            limit: u64::MAX,
        }
    }

    pub fn apply<T>(&self, items: Vec<T>) -> PaginatedResult<T> {
        let total = items.len() as u64;
        let items = items
            .into_iter()
            .skip(usize::try_from(self.offset).unwrap_or(usize::MAX))
            .take(usize::try_from(self.limit).unwrap_or(usize::MAX))
            .collect();
        PaginatedResult {
            items,
            total,
            offset: self.offset,
            limit: self.limit,
        }
    }
}

/// A paginated result set.
#[derive(Debug, Clone)]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

/// Filter for linked-resource lookups
#[derive(Debug, Clone)]
pub struct LinkedResourceFilter {
    /// Resources to follow links from; several ids make a batch lookup
    pub origin_ids: Vec<i64>,
    pub direction: LinkDirection,
    pub link_type: Option<String>,
    /// Restrict the resources found at the other end
    pub resource_types: Vec<String>,
}

impl LinkedResourceFilter {
    pub fn from_origin(origin_id: i64, direction: LinkDirection) -> Self {
        Self {
            origin_ids: vec![origin_id],
            direction,
            link_type: None,
            resource_types: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },

    #[error("{entity} {id} is in state {current}, expected one of {expected:?}")]
    StateConflict {
        entity: &'static str,
        id: i64,
        current: String,
        expected: Vec<String>,
    },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }
}

impl From<GatewayError> for crate::error::CoreError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NotFound { entity, key } => Self::not_found(entity, key),
            GatewayError::StateConflict {
                entity,
                id,
                current,
                expected,
            } => Self::conflict(
                entity,
                id,
                format!("state {current} is not one of {expected:?}"),
            ),
            other => Self::transaction("persistence", other),
        }
    }
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    // -----------------------------------------------------------------------
    // Containers
    // -----------------------------------------------------------------------

    /// Insert a container row in `PENDING`
    async fn add_container(&self, new: NewContainer) -> GatewayResult<Container>;

    async fn get_container(&self, key: &EntityKey) -> GatewayResult<Container>;

    async fn list_containers(
        &self,
        filter: &ContainerFilter,
        page: Pagination,
    ) -> GatewayResult<PaginatedResult<Container>>;

    async fn update_container(&self, id: i64, update: ContainerUpdate)
        -> GatewayResult<Container>;

    /// Unconditional state write
    async fn set_container_state(
        &self,
        id: i64,
        state: ContainerState,
        last_error: Option<String>,
    ) -> GatewayResult<Container>;

    /// Compare-and-swap: write `to` only if the current state is in `allowed_from`
    async fn transition_container_state(
        &self,
        id: i64,
        allowed_from: &[ContainerState],
        to: ContainerState,
    ) -> GatewayResult<Container>;

    /// Hard delete
    async fn remove_container(&self, id: i64) -> GatewayResult<()>;

    // -----------------------------------------------------------------------
    // Resources
    // -----------------------------------------------------------------------

    async fn add_resource(&self, new: NewResource) -> GatewayResult<Resource>;

    async fn get_resource(&self, key: &EntityKey) -> GatewayResult<Resource>;

    async fn get_resource_by_ext_id(
        &self,
        container_id: i64,
        ext_id: &str,
    ) -> GatewayResult<Resource>;

    async fn list_resources(
        &self,
        filter: &ResourceFilter,
        page: Pagination,
    ) -> GatewayResult<PaginatedResult<Resource>>;

    async fn count_resources(&self, filter: &ResourceFilter) -> GatewayResult<u64>;

    async fn update_resource(&self, id: i64, update: ResourceUpdate) -> GatewayResult<Resource>;

    async fn set_resource_state(
        &self,
        id: i64,
        state: ResourceState,
        last_error: Option<String>,
    ) -> GatewayResult<Resource>;

    async fn transition_resource_state(
        &self,
        id: i64,
        allowed_from: &[ResourceState],
        to: ResourceState,
    ) -> GatewayResult<Resource>;

    /// Mark `DELETED`, `active = false` and set `expiry_date`
    async fn soft_delete_resource(&self, id: i64) -> GatewayResult<Resource>;

    /// Hard delete. Tag associations go with the row; links must already be gone.
    async fn remove_resource(&self, id: i64) -> GatewayResult<()>;

    // -----------------------------------------------------------------------
    // Links
    // -----------------------------------------------------------------------

    async fn add_link(&self, new: NewResourceLink) -> GatewayResult<ResourceLink>;

    async fn get_link(&self, key: &EntityKey) -> GatewayResult<ResourceLink>;

    async fn list_links(
        &self,
        filter: &LinkFilter,
        page: Pagination,
    ) -> GatewayResult<PaginatedResult<ResourceLink>>;

    async fn update_link_attributes(
        &self,
        id: i64,
        attributes: Value,
    ) -> GatewayResult<ResourceLink>;

    async fn remove_link(&self, id: i64) -> GatewayResult<()>;

    /// Remove every link that matches the filter, returning how many went away
    async fn remove_links(&self, filter: &LinkFilter) -> GatewayResult<u64>;

    async fn list_linked_resources(
        &self,
        filter: &LinkedResourceFilter,
        page: Pagination,
    ) -> GatewayResult<PaginatedResult<LinkedResource>>;

    // -----------------------------------------------------------------------
    // Tags
    // -----------------------------------------------------------------------

    /// Get-or-create a tag by value
    async fn add_tag(&self, value: &str) -> GatewayResult<ResourceTag>;

    /// Attach a tag; returns `false` when it was already attached
    async fn attach_tag(&self, target: TagTarget, tag_id: i64) -> GatewayResult<bool>;

    /// Detach a tag; returns `false` when it was not attached
    async fn detach_tag(&self, target: TagTarget, tag_id: i64) -> GatewayResult<bool>;

    async fn list_tags(&self, target: TagTarget) -> GatewayResult<Vec<ResourceTag>>;

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    async fn add_job(&self, new: NewJob) -> GatewayResult<Job>;

    async fn get_job(&self, job_id: &str) -> GatewayResult<Job>;

    async fn list_jobs(
        &self,
        filter: &JobFilter,
        page: Pagination,
    ) -> GatewayResult<PaginatedResult<Job>>;
}
