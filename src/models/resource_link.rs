//! # Resource Link
//!
//! Directed, typed relation between two resources (vpc membership, security-group
//! attachment, `relation.<site-id>`). Parent/child is not a link: it lives in
//! `Resource::parent_id`.
//!
//! Links are not unique per `(start, end, type)`; several links of the same type may
//! join the same pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ResourceLink {
    pub id: i64,
    pub uuid: Uuid,
    pub objid: String,
    pub name: String,
    pub link_type: String,
    pub start_resource_id: i64,
    pub end_resource_id: i64,
    pub attributes: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceLink {
    pub fn touches(&self, resource_id: i64) -> bool {
        self.start_resource_id == resource_id || self.end_resource_id == resource_id
    }

    /// The `reuse` flag marks a link whose end resource was reused rather than created
    pub fn is_reuse(&self) -> bool {
        self.attributes
            .get("reuse")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewResourceLink {
    pub objid: String,
    pub name: String,
    pub link_type: String,
    pub start_resource_id: i64,
    pub end_resource_id: i64,
    pub attributes: Value,
}

/// Which side of a link a resource sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkDirection {
    /// Resource is the start: follow links to their end resources
    Outgoing,
    /// Resource is the end: follow links back to their start resources
    Incoming,
    Both,
}

#[derive(Debug, Clone, Default)]
pub struct LinkFilter {
    /// Either endpoint
    pub resource_id: Option<i64>,
    pub start_resource_id: Option<i64>,
    pub end_resource_id: Option<i64>,
    pub link_type: Option<String>,
}

impl LinkFilter {
    pub fn touching(resource_id: i64) -> Self {
        Self {
            resource_id: Some(resource_id),
            ..Default::default()
        }
    }

    pub fn between(start_resource_id: i64, end_resource_id: i64) -> Self {
        Self {
            start_resource_id: Some(start_resource_id),
            end_resource_id: Some(end_resource_id),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, link_type: impl Into<String>) -> Self {
        self.link_type = Some(link_type.into());
        self
    }

    pub fn matches(&self, link: &ResourceLink) -> bool {
        self.resource_id.map_or(true, |id| link.touches(id))
            && self
                .start_resource_id
                .map_or(true, |id| id == link.start_resource_id)
            && self
                .end_resource_id
                .map_or(true, |id| id == link.end_resource_id)
            && self
                .link_type
                .as_ref()
                .map_or(true, |t| *t == link.link_type)
    }
}

/// A linked resource together with the link that reaches it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedResource {
    pub link: ResourceLink,
    /// The resource the link was followed from
    pub origin_id: i64,
    pub resource: crate::models::Resource,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn link(start: i64, end: i64, link_type: &str) -> ResourceLink {
        ResourceLink {
            id: 1,
            uuid: Uuid::new_v4(),
            objid: "c//l".to_string(),
            name: format!("{start}-{end}"),
            link_type: link_type.to_string(),
            start_resource_id: start,
            end_resource_id: end,
            attributes: json!({"reuse": true}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_filter_directions() {
        let l = link(1, 2, "vpc");
        assert!(LinkFilter::touching(1).matches(&l));
        assert!(LinkFilter::touching(2).matches(&l));
        assert!(!LinkFilter::touching(3).matches(&l));
        assert!(LinkFilter::between(1, 2).matches(&l));
        assert!(!LinkFilter::between(2, 1).matches(&l));
        assert!(!LinkFilter::touching(1).with_type("security-group").matches(&l));
    }

    #[test]
    fn test_reuse_flag() {
        assert!(link(1, 2, "vpc").is_reuse());
    }
}
