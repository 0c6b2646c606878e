//! # Orchestration
//!
//! Everything between a caller's request and the plugin doing the remote work.
//!
//! ## Core Components
//!
//! - **OperationDispatcher**: entry point for resource lifecycle operations. Validates,
//!   authorizes, runs the plugin `pre_*` hook, assembles a pipeline and hands it to the
//!   executor.
//! - **ContainerManager**: container registration, connection validation and removal.
//! - **PipelineAssembler**: builds the ordered step list for each operation.
//! - **Pipeline**: pre-step, business steps, post-step, with retry and resume.
//! - **TaskExecutor**: inline or background execution with task status tracking.
//! - **SessionPool**: one live platform client per container.
//! - **ControlPlane**: wires all of the above together at startup.

pub mod assembler;
pub mod bootstrap;
pub mod container_manager;
pub mod context;
pub mod dispatcher;
pub mod executor;
pub mod pipeline;
pub mod services;
pub mod session;
pub mod steps;

pub use assembler::{context_for, PipelineAssembler};
pub use bootstrap::{ControlPlane, ControlPlaneBuilder, ControlPlaneStatus};
pub use container_manager::{ContainerManager, ContainerRequest};
pub use context::{Operation, OperationContext};
pub use dispatcher::{CreateRequest, DispatchOutcome, OperationDispatcher};
pub use executor::{TaskExecutor, TaskState, TaskStatus, WorkerPoolExecutor};
pub use pipeline::{
    ContainerFailureHandler, FailureHandler, Pipeline, PipelineBuilder, ResourceFailureHandler,
    RetryPolicy, Step,
};
pub use services::CoreServices;
pub use session::{ContainerSession, SessionPool};
pub use steps::{
    ApplyTagsStep, CompleteContainerStep, EnterContainerStateStep, EnterResourceStateStep,
    ExpungeResourceStep, FinalizeResourceStep, PluginHook, PluginHookStep, SoftDeleteStep,
};
