//! # Resource Graph
//!
//! Directed, typed links between resources. Parent/child is a column on the resource
//! row; links model the cross-cutting relations (vpc membership, security-group
//! attachment, `relation.<site-id>`).
//!
//! Links are not unique per `(start, end, type)`. [`ResourceGraph::is_linked`] ignores
//! direction, while the `get_*` lookups are direction-aware.

use crate::error::{CoreError, CoreResult};
use crate::models::{
    merge_attribute, objid, EntityKey, LinkDirection, LinkFilter, LinkedResource,
    NewResourceLink, ResourceLink, ResourceTag, TagTarget,
};
use crate::persistence::{LinkedResourceFilter, PaginatedResult, Pagination, PersistenceGateway};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Parameters of a new link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRequest {
    pub name: String,
    pub link_type: String,
    pub start_resource_id: i64,
    pub end_resource_id: i64,
    #[serde(default)]
    pub attributes: Value,
}

impl LinkRequest {
    pub fn new(link_type: impl Into<String>, start_resource_id: i64, end_resource_id: i64) -> Self {
        let link_type = link_type.into();
        Self {
            name: format!("{link_type}-{start_resource_id}-{end_resource_id}"),
            link_type,
            start_resource_id,
            end_resource_id,
            attributes: Value::Object(Default::default()),
        }
    }

    pub fn with_attributes(mut self, attributes: Value) -> Self {
        self.attributes = attributes;
        self
    }
}

#[derive(Clone)]
pub struct ResourceGraph {
    gateway: Arc<dyn PersistenceGateway>,
}

impl ResourceGraph {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { gateway }
    }

    /// Link two existing resources. The link objid hangs below the start resource.
    pub async fn add_link(&self, request: LinkRequest) -> CoreResult<ResourceLink> {
        if request.link_type.trim().is_empty() {
            return Err(CoreError::Validation("link type must not be empty".to_string()));
        }
        let start = self
            .gateway
            .get_resource(&EntityKey::Id(request.start_resource_id))
            .await?;
        self.gateway
            .get_resource(&EntityKey::Id(request.end_resource_id))
            .await?;

        let link = self
            .gateway
            .add_link(NewResourceLink {
                objid: objid::child_of(&start.objid),
                name: request.name,
                link_type: request.link_type,
                start_resource_id: request.start_resource_id,
                end_resource_id: request.end_resource_id,
                attributes: request.attributes,
            })
            .await?;
        info!(
            link_id = link.id,
            link_type = %link.link_type,
            start = link.start_resource_id,
            end = link.end_resource_id,
            "Added resource link"
        );
        Ok(link)
    }

    pub async fn get_link(&self, key: &EntityKey) -> CoreResult<ResourceLink> {
        Ok(self.gateway.get_link(key).await?)
    }

    pub async fn get_links(
        &self,
        filter: &LinkFilter,
        page: Pagination,
    ) -> CoreResult<PaginatedResult<ResourceLink>> {
        Ok(self.gateway.list_links(filter, page).await?)
    }

    /// Whether any link joins the two resources, in either direction
    pub async fn is_linked(
        &self,
        first: i64,
        second: i64,
        link_type: Option<&str>,
    ) -> CoreResult<bool> {
        for (start, end) in [(first, second), (second, first)] {
            let mut filter = LinkFilter::between(start, end);
            filter.link_type = link_type.map(str::to_string);
            if self.gateway.list_links(&filter, Pagination::new(0, 1)).await?.total > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Resources reachable from one resource over links in `direction`
    pub async fn get_linked_resources(
        &self,
        resource_id: i64,
        direction: LinkDirection,
        link_type: Option<&str>,
        resource_types: &[String],
        page: Pagination,
    ) -> CoreResult<PaginatedResult<LinkedResource>> {
        let mut filter = LinkedResourceFilter::from_origin(resource_id, direction);
        filter.link_type = link_type.map(str::to_string);
        filter.resource_types = resource_types.to_vec();
        Ok(self.gateway.list_linked_resources(&filter, page).await?)
    }

    /// Batch variant: end resources of outgoing links from every resource in `start_ids`
    pub async fn get_directed_linked_resources(
        &self,
        start_ids: &[i64],
        link_type: Option<&str>,
        resource_types: &[String],
        page: Pagination,
    ) -> CoreResult<PaginatedResult<LinkedResource>> {
        if start_ids.is_empty() {
            return Ok(page.apply(Vec::new()));
        }
        let filter = LinkedResourceFilter {
            origin_ids: start_ids.to_vec(),
            direction: LinkDirection::Outgoing,
            link_type: link_type.map(str::to_string),
            resource_types: resource_types.to_vec(),
        };
        Ok(self.gateway.list_linked_resources(&filter, page).await?)
    }

    /// Merge `patch` into the link attributes
    pub async fn update_link(&self, link_id: i64, patch: &Value) -> CoreResult<ResourceLink> {
        let link = self.gateway.get_link(&EntityKey::Id(link_id)).await?;
        let mut attributes = link.attributes;
        merge_attribute(&mut attributes, patch);
        Ok(self
            .gateway
            .update_link_attributes(link_id, attributes)
            .await?)
    }

    pub async fn remove_link(&self, link_id: i64) -> CoreResult<()> {
        self.gateway.remove_link(link_id).await?;
        debug!(link_id, "Removed resource link");
        Ok(())
    }

    /// Remove every link touching the resource, as start or end
    pub async fn expunge_links_for(&self, resource_id: i64) -> CoreResult<u64> {
        let removed = self
            .gateway
            .remove_links(&LinkFilter::touching(resource_id))
            .await?;
        if removed > 0 {
            debug!(resource_id, removed, "Expunged links touching resource");
        }
        Ok(removed)
    }

    pub async fn add_link_tag(&self, link_id: i64, value: &str) -> CoreResult<bool> {
        self.gateway.get_link(&EntityKey::Id(link_id)).await?;
        let tag = self.gateway.add_tag(value).await?;
        Ok(self.gateway.attach_tag(TagTarget::Link(link_id), tag.id).await?)
    }

    pub async fn remove_link_tag(&self, link_id: i64, value: &str) -> CoreResult<bool> {
        let tags = self.gateway.list_tags(TagTarget::Link(link_id)).await?;
        match tags.into_iter().find(|tag| tag.value == value) {
            Some(tag) => Ok(self.gateway.detach_tag(TagTarget::Link(link_id), tag.id).await?),
            None => Ok(false),
        }
    }

    pub async fn list_link_tags(&self, link_id: i64) -> CoreResult<Vec<ResourceTag>> {
        Ok(self.gateway.list_tags(TagTarget::Link(link_id)).await?)
    }
}
