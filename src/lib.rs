#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Cloud Manager Core
//!
//! Control-plane core for a multi-backend cloud resource manager.
//!
//! ## Overview
//!
//! Containers are connections to remote platforms (an OpenStack region, a vSphere
//! server, a DNS server). Resources are the entities inside them: servers, networks,
//! volumes, records. Every resource has a lifecycle state that doubles as a cooperative
//! lock, every mutating operation runs as a pipeline of steps, and a reconciliation
//! engine keeps local inventory aligned with what the platforms actually hold.
//!
//! ## Module Organization
//!
//! - [`models`] - Containers, resources, links, tags and jobs
//! - [`persistence`] - Gateway contract with in-memory and PostgreSQL backends
//! - [`state_machine`] - Resource and container lifecycle transitions
//! - [`plugin`] - Capability traits implemented by backend integrations
//! - [`registry`] - Startup-time registries of drivers and resource types
//! - [`orchestration`] - Dispatcher, pipelines, executor and the [`ControlPlane`] handle
//! - [`discovery`] - Reconciliation of local and remote inventory
//! - [`graph`] - Typed links between resources
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`events`] - Lifecycle event broadcasting
//!
//! ## Quick Start
//!
//! ```rust
//! use cloudmgr_core::config::{ConfigManager, CoreConfig};
//! use cloudmgr_core::orchestration::{ControlPlane, CreateRequest, ContainerRequest};
//! use cloudmgr_core::test_helpers::{FakeDriver, FakePlatform, FakeResourcePlugin};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> cloudmgr_core::error::CoreResult<()> {
//! let platform = FakePlatform::new();
//! let plane = ControlPlane::builder(ConfigManager::from_config(CoreConfig::default())?)
//!     .driver(Arc::new(FakeDriver::new(platform.clone())))?
//!     .resource_type(Arc::new(FakeResourcePlugin::new("Fake.Server", platform)))?
//!     .build()?;
//!
//! let container = plane
//!     .containers()
//!     .add_container(ContainerRequest {
//!         name: "region-1".to_string(),
//!         desc: String::new(),
//!         category: "Private".to_string(),
//!         container_type: FakeDriver::CONTAINER_TYPE.to_string(),
//!         implementation_class: FakeDriver::IMPLEMENTATION_CLASS.to_string(),
//!         connection: serde_json::json!({}),
//!     })
//!     .await?;
//!
//! let outcome = plane
//!     .dispatcher()
//!     .create(CreateRequest::new("Fake.Server", container.id, "web-01").sync(true))
//!     .await?;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod cache;
pub mod config;
pub mod constants;
pub mod discovery;
pub mod error;
pub mod events;
pub mod graph;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod plugin;
pub mod registry;
pub mod state_machine;
pub mod test_helpers;

pub use config::{ConfigManager, CoreConfig};
pub use discovery::{ReconciliationEngine, ReconciliationReport, SyncOutcome, SyncRequest};
pub use error::{CoreError, CoreResult};
pub use events::EventPublisher;
pub use graph::ResourceGraph;
pub use models::{Container, EntityKey, Resource, ResourceLink};
pub use orchestration::{ControlPlane, OperationDispatcher};
pub use persistence::{MemoryGateway, PersistenceGateway};
pub use state_machine::{ContainerState, ResourceState};
