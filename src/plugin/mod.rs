//! # Plugin Contracts
//!
//! Typed capability set implemented by backend integrations.
//!
//! - A [`ContainerDriver`] knows how to open a [`PlatformClient`] for one container type
//!   (an OpenStack region, a vSphere server, a DNS server).
//! - A [`ResourcePlugin`] describes one concrete resource type and exposes the
//!   lifecycle capabilities it supports through the accessor methods. A plugin that
//!   cannot be created simply returns `None` from [`ResourcePlugin::creatable`], and the
//!   dispatcher rejects `create` for that type before touching anything.
//!
//! Plugins are registered once at startup in the
//! [`ResourceTypeRegistry`](crate::registry::ResourceTypeRegistry) and looked up by
//! resource-type tag.
//!
//! Hook naming follows the pipeline phases: `pre_*` runs in the dispatcher before the
//! pipeline is assembled and may reshape the context, `do_*` is the business step, and
//! `post_*` runs right before the outcome is persisted.

use crate::error::CoreResult;
use crate::models::{Container, Resource};
use crate::orchestration::{ContainerSession, Operation, OperationContext, Step};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;

/// Live connection to a remote platform, owned by a container session
#[async_trait]
pub trait PlatformClient: Send + Sync + 'static {
    /// Downcast hook for plugins that need their concrete client type
    fn as_any(&self) -> &dyn Any;

    /// Cheap reachability probe
    async fn ping(&self) -> bool;

    async fn close(&self) {}
}

/// Opens platform connections for one container type
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    fn container_type(&self) -> &str;

    fn implementation_class(&self) -> &str;

    /// Validate the connection blob before a container row is written
    async fn validate_connection(&self, _connection: &Value) -> CoreResult<()> {
        Ok(())
    }

    async fn connect(&self, container: &Container) -> anyhow::Result<Arc<dyn PlatformClient>>;
}

/// One concrete resource type
pub trait ResourcePlugin: Send + Sync {
    /// Registry key, e.g. `OpenStack.Server`
    fn resource_type(&self) -> &str;

    fn implementation_class(&self) -> &str;

    /// Container type this resource lives in
    fn container_type(&self) -> &str;

    /// Whether business steps call the remote platform. Remote-backed operations run in
    /// the background unless the caller asks otherwise.
    fn runs_remote(&self) -> bool {
        true
    }

    fn creatable(&self) -> Option<&dyn Creatable> {
        None
    }

    fn importable(&self) -> Option<&dyn Importable> {
        None
    }

    fn updatable(&self) -> Option<&dyn Updatable> {
        None
    }

    fn deletable(&self) -> Option<&dyn Deletable> {
        None
    }

    fn actionable(&self) -> Option<&dyn Actionable> {
        None
    }

    fn discoverable(&self) -> Option<&dyn Discoverable> {
        None
    }

    /// Additional business steps appended after the `do_*` step of an operation
    fn extra_steps(&self, _operation: Operation) -> Vec<Arc<dyn Step>> {
        Vec::new()
    }
}

#[async_trait]
pub trait Creatable: Send + Sync {
    async fn pre_create(
        &self,
        _container: &Container,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        Ok(ctx)
    }

    /// Provision the entity remotely. Must set `ctx.ext_id`.
    async fn do_create(
        &self,
        session: &ContainerSession,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext>;

    async fn post_create(
        &self,
        _session: &ContainerSession,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        Ok(ctx)
    }
}

#[async_trait]
pub trait Importable: Send + Sync {
    async fn pre_import(
        &self,
        _container: &Container,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        Ok(ctx)
    }

    /// Verify the remote entity named by `ctx.ext_id` and read its attributes
    async fn do_import(
        &self,
        session: &ContainerSession,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext>;

    async fn post_import(
        &self,
        _session: &ContainerSession,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        Ok(ctx)
    }
}

#[async_trait]
pub trait Updatable: Send + Sync {
    async fn pre_update(
        &self,
        _resource: &Resource,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        Ok(ctx)
    }

    async fn do_update(
        &self,
        session: &ContainerSession,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext>;

    async fn pre_patch(
        &self,
        _resource: &Resource,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        Ok(ctx)
    }

    /// Apply an already merged attribute blob remotely; defaults to a plain update
    async fn do_patch(
        &self,
        session: &ContainerSession,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        self.do_update(session, ctx).await
    }
}

#[async_trait]
pub trait Deletable: Send + Sync {
    async fn pre_delete(
        &self,
        _resource: &Resource,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        Ok(ctx)
    }

    async fn do_delete(
        &self,
        session: &ContainerSession,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext>;

    async fn pre_expunge(
        &self,
        _resource: &Resource,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        Ok(ctx)
    }

    /// Remove the remote entity for good. Must succeed when it is already gone.
    async fn do_expunge(
        &self,
        session: &ContainerSession,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        self.do_delete(session, ctx).await
    }
}

#[async_trait]
pub trait Actionable: Send + Sync {
    /// Names accepted by `do_action`
    fn actions(&self) -> Vec<String>;

    async fn pre_action(
        &self,
        _resource: &Resource,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext> {
        Ok(ctx)
    }

    async fn do_action(
        &self,
        session: &ContainerSession,
        ctx: OperationContext,
    ) -> CoreResult<OperationContext>;
}

#[async_trait]
pub trait Discoverable: Send + Sync {
    /// Remote entities of this type whose `ext_id` is not in `known_ext_ids`
    async fn discover_new(
        &self,
        session: &ContainerSession,
        ext_id_hint: Option<&str>,
        known_ext_ids: &HashSet<String>,
    ) -> CoreResult<Vec<DiscoveredEntity>>;

    /// Full remote inventory of this type
    async fn discover_died(&self, session: &ContainerSession) -> CoreResult<Vec<RemoteEntity>>;

    /// Turn a discovered entity into insertion parameters
    async fn synchronize(
        &self,
        container: &Container,
        entity: &DiscoveredEntity,
    ) -> CoreResult<SyncedResource>;
}

/// Remote entity reported by `discover_new`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredEntity {
    /// Registry key of the plugin that will own the local row
    pub resource_type: String,
    pub ext_id: String,
    pub parent_ext_id: Option<String>,
    /// Platform-specific kind
    pub kind: String,
    pub name: String,
    /// Depth in the remote hierarchy; parents are inserted before children
    pub level: u32,
}

/// Entry of the remote inventory returned by `discover_died`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntity {
    pub ext_id: String,
    pub name: String,
    #[serde(default)]
    pub attributes: Value,
}

/// Insertion parameters produced by `synchronize`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedResource {
    pub name: String,
    pub desc: String,
    pub ext_id: String,
    pub parent_ext_id: Option<String>,
    pub attribute: Value,
}
