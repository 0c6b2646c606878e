//! # Container
//!
//! A container is a connection to one remote orchestrator or management platform
//! (an OpenStack region, a vSphere server, a DNS server, a monitoring system). It owns
//! every resource created or discovered through it.
//!
//! The `(category, container_type, implementation_class)` triple selects the
//! [`ContainerDriver`](crate::plugin::ContainerDriver) that knows how to open a
//! connection from the opaque `connection` blob.

use crate::state_machine::ContainerState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Container {
    pub id: i64,
    pub uuid: Uuid,
    pub objid: String,
    pub name: String,
    pub desc: String,
    pub category: String,
    pub container_type: String,
    pub implementation_class: String,
    /// Connection configuration, interpreted only by the driver
    pub connection: Value,
    #[sqlx(try_from = "String")]
    pub state: ContainerState,
    pub active: bool,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expiry_date: Option<DateTime<Utc>>,
}

impl Container {
    pub fn is_usable(&self) -> bool {
        self.active && self.state.is_usable()
    }
}

/// New container for creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewContainer {
    pub objid: String,
    pub name: String,
    pub desc: String,
    pub category: String,
    pub container_type: String,
    pub implementation_class: String,
    pub connection: Value,
}

/// Partial update of the mutable container fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerUpdate {
    pub name: Option<String>,
    pub desc: Option<String>,
    pub connection: Option<Value>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    pub container_type: Option<String>,
    pub category: Option<String>,
    pub state: Option<ContainerState>,
    pub name: Option<String>,
}

impl ContainerFilter {
    pub fn matches(&self, container: &Container) -> bool {
        self.container_type
            .as_ref()
            .map_or(true, |t| *t == container.container_type)
            && self
                .category
                .as_ref()
                .map_or(true, |c| *c == container.category)
            && self.state.map_or(true, |s| s == container.state)
            && self.name.as_ref().map_or(true, |n| *n == container.name)
    }
}
