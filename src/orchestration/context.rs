//! # Operation Context
//!
//! The typed parameter bag threaded through every step of a pipeline. Each step takes
//! the context by value and hands back the (possibly updated) context; nothing is
//! shared between steps except through it.
//!
//! The context is serializable so a background task can be re-submitted from its last
//! recorded position: `next_step` is the index of the first step that has not yet
//! completed.

use crate::auth::operations;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Lifecycle operations the control plane drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Import,
    Update,
    Patch,
    Delete,
    Expunge,
    Action,
    Synchronize,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Import => "import",
            Self::Update => "update",
            Self::Patch => "patch",
            Self::Delete => "delete",
            Self::Expunge => "expunge",
            Self::Action => "action",
            Self::Synchronize => "synchronize",
        }
    }

    /// Operation name handed to the authorizer
    pub fn authorization_operation(&self) -> &'static str {
        match self {
            Self::Create | Self::Import => operations::INSERT,
            Self::Update | Self::Patch | Self::Action => operations::UPDATE,
            Self::Delete | Self::Expunge => operations::DELETE,
            Self::Synchronize => operations::USE,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationContext {
    pub operation: Operation,
    /// Executor task id, set for background runs
    pub task_id: Option<String>,
    pub resource_type: String,
    pub container_id: i64,
    pub resource_id: Option<i64>,
    pub resource_uuid: Option<Uuid>,
    pub objid: Option<String>,
    pub parent_id: Option<i64>,
    pub name: String,
    pub desc: String,
    /// Remote identifier, set by the business step that provisioned the entity
    pub ext_id: Option<String>,
    /// Attribute blob to persist when the operation completes
    pub attribute: Value,
    /// Caller parameters, free-form per resource type
    pub params: Value,
    /// Tags to apply on create
    pub tags: Vec<String>,
    /// Action name for `Operation::Action`
    pub action: Option<String>,
    pub force: bool,
    /// Set once the pre-step has moved the resource into its in-progress state
    pub lock_held: bool,
    /// Index of the next step to run
    pub next_step: usize,
    /// Progress messages, one per completed step
    pub progress: Vec<String>,
    /// Operation-specific result (e.g. a reconciliation report)
    pub result: Value,
}

impl OperationContext {
    pub fn new(operation: Operation, resource_type: impl Into<String>, container_id: i64) -> Self {
        Self {
            operation,
            task_id: None,
            resource_type: resource_type.into(),
            container_id,
            resource_id: None,
            resource_uuid: None,
            objid: None,
            parent_id: None,
            name: String::new(),
            desc: String::new(),
            ext_id: None,
            attribute: Value::Object(Default::default()),
            params: Value::Object(Default::default()),
            tags: Vec::new(),
            action: None,
            force: false,
            lock_held: false,
            next_step: 0,
            progress: Vec::new(),
            result: Value::Null,
        }
    }

    pub fn with_resource(mut self, resource_id: i64, resource_uuid: Uuid) -> Self {
        self.resource_id = Some(resource_id);
        self.resource_uuid = Some(resource_uuid);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }

    pub fn with_parent(mut self, parent_id: Option<i64>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_ext_id(mut self, ext_id: impl Into<String>) -> Self {
        self.ext_id = Some(ext_id.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Resource the operation targets; missing only for container-level runs
    pub fn require_resource_id(&self) -> CoreResult<i64> {
        self.resource_id.ok_or_else(|| {
            CoreError::Internal(format!(
                "{} pipeline for {} has no resource id",
                self.operation, self.resource_type
            ))
        })
    }

    /// Read a string parameter
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Read a boolean parameter, falling back to `default`
    pub fn param_bool(&self, key: &str, default: bool) -> bool {
        self.params
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    pub fn record_progress(&mut self, message: impl Into<String>) {
        self.progress.push(message.into());
    }
}
