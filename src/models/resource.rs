//! # Resource
//!
//! A locally tracked object mirroring an entity managed through a container: a VM, a
//! network, a DNS record, a volume, a monitoring item.
//!
//! ## Invariants
//!
//! - `container_id` is set once at creation and never changes.
//! - `objid` is `parent.objid + "//" + segment` (or the container's objid for top-level
//!   resources) and is never mutated.
//! - `ext_id` stays empty until the first successful provisioning.
//! - `state` doubles as a cooperative lock: new lifecycle operations are only accepted
//!   from `ACTIVE`, `ERROR` or `UNKNOWN`.

use crate::state_machine::ResourceState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Resource {
    pub id: i64,
    pub uuid: Uuid,
    pub objid: String,
    pub name: String,
    pub desc: String,
    pub resource_type: String,
    pub implementation_class: String,
    pub container_id: i64,
    pub parent_id: Option<i64>,
    /// Remote platform identifier, empty until provisioned
    pub ext_id: String,
    #[sqlx(try_from = "String")]
    pub state: ResourceState,
    pub active: bool,
    pub attribute: Value,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker
    pub expiry_date: Option<DateTime<Utc>>,
}

impl Resource {
    pub fn has_ext_id(&self) -> bool {
        !self.ext_id.is_empty()
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.expiry_date.is_some()
    }
}

/// New resource for creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewResource {
    pub objid: String,
    pub name: String,
    pub desc: String,
    pub resource_type: String,
    pub implementation_class: String,
    pub container_id: i64,
    pub parent_id: Option<i64>,
    pub ext_id: String,
    pub state: ResourceState,
    pub active: bool,
    pub attribute: Value,
}

/// Partial update of the mutable resource fields. `container_id`, `objid` and `state`
/// are deliberately absent: the first two are immutable and state goes through the
/// state machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUpdate {
    pub name: Option<String>,
    pub desc: Option<String>,
    pub ext_id: Option<String>,
    pub attribute: Option<Value>,
    pub active: Option<bool>,
}

impl ResourceUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.desc.is_none()
            && self.ext_id.is_none()
            && self.attribute.is_none()
            && self.active.is_none()
    }
}

/// Filter for resource listings and counts
#[derive(Debug, Clone, Default)]
pub struct ResourceFilter {
    pub container_id: Option<i64>,
    pub parent_id: Option<i64>,
    /// Empty means any type
    pub resource_types: Vec<String>,
    pub ext_id: Option<String>,
    pub name: Option<String>,
    pub state: Option<ResourceState>,
    pub objid_prefix: Option<String>,
    /// Soft-deleted rows are hidden unless set
    pub include_deleted: bool,
}

impl ResourceFilter {
    pub fn by_container(container_id: i64) -> Self {
        Self {
            container_id: Some(container_id),
            ..Default::default()
        }
    }

    pub fn children_of(parent_id: i64) -> Self {
        Self {
            parent_id: Some(parent_id),
            include_deleted: true,
            ..Default::default()
        }
    }

    pub fn with_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_types.push(resource_type.into());
        self
    }

    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        self.container_id.map_or(true, |id| id == resource.container_id)
            && self.parent_id.map_or(true, |id| Some(id) == resource.parent_id)
            && (self.resource_types.is_empty()
                || self.resource_types.contains(&resource.resource_type))
            && self.ext_id.as_ref().map_or(true, |e| *e == resource.ext_id)
            && self.name.as_ref().map_or(true, |n| *n == resource.name)
            && self.state.map_or(true, |s| s == resource.state)
            && self
                .objid_prefix
                .as_ref()
                .map_or(true, |p| resource.objid.starts_with(p.as_str()))
            && (self.include_deleted || resource.expiry_date.is_none())
    }
}

/// Merge `patch` into `target` following JSON merge-patch semantics: objects merge
/// recursively, `null` removes a key, anything else replaces.
pub fn merge_attribute(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target_map), Some(patch_map)) => {
            for (key, value) in patch_map {
                if value.is_null() {
                    target_map.remove(key);
                } else {
                    merge_attribute(
                        target_map.entry(key.clone()).or_insert(Value::Null),
                        value,
                    );
                }
            }
        }
        _ => *target = patch.clone(),
    }
}
