//! # Lifecycle State Machines
//!
//! Legal states and transition gates for containers and resources.
//!
//! ## Overview
//!
//! A transition is `(current state, event) -> target state`. Each state machine
//! resolves the target from its table, runs the guards attached to the event
//! (children present, container usable, container empty), persists the new state with
//! a compare-and-swap at the gateway and then runs its post-transition actions
//! (event publishing, failure logging).
//!
//! The state field doubles as a cooperative lock: an operation "takes" a resource by
//! moving it into an in-progress state, and any other operation arriving meanwhile is
//! refused with a conflict instead of being queued.

pub mod actions;
pub mod container_state_machine;
pub mod errors;
pub mod events;
pub mod guards;
pub mod resource_state_machine;
pub mod states;

// Re-export main types for convenient access
pub use container_state_machine::ContainerStateMachine;
pub use errors::{ActionError, GuardError, StateMachineError, StateMachineResult};
pub use events::{ContainerEvent, ResourceEvent};
pub use resource_state_machine::ResourceStateMachine;
pub use states::{ContainerState, ResourceState};

// Common traits
pub use actions::StateAction;
pub use guards::StateGuard;
