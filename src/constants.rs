//! # System Constants
//!
//! Event names, objid conventions and state groupings shared by the state machine,
//! the dispatcher and the reconciliation engine.

use crate::state_machine::{ContainerState, ResourceState};

/// Lifecycle events published on every state mutation
pub mod events {
    pub const RESOURCE_STATE_CHANGED: &str = "resource.state_changed";
    pub const RESOURCE_EXPUNGED: &str = "resource.expunged";
    pub const CONTAINER_STATE_CHANGED: &str = "container.state_changed";
    pub const CONTAINER_EXPUNGED: &str = "container.expunged";
    pub const RECONCILIATION_COMPLETED: &str = "reconciliation.completed";
}

/// Hierarchical object identifiers
pub mod objid {
    /// Separator between objid segments
    pub const SEPARATOR: &str = "//";
    /// Wildcard segment accepted by authorization grants
    pub const WILDCARD: &str = "*";
    /// Length of a freshly generated segment
    pub const SEGMENT_LENGTH: usize = 10;
}

/// Object types handed to the authorization collaborator
pub mod objtype {
    pub const CONTAINER: &str = "container";
    pub const RESOURCE: &str = "resource";
}

/// Well-known link types
pub mod link_types {
    pub const VPC: &str = "vpc";
    pub const SECURITY_GROUP: &str = "security-group";
    pub const RELATION_PREFIX: &str = "relation.";
}

/// State groupings used as transition gates
pub mod status_groups {
    use super::{ContainerState, ResourceState};

    /// States in which a resource accepts a new lifecycle operation
    pub const OPERABLE_STATES: [ResourceState; 3] = [
        ResourceState::Active,
        ResourceState::Error,
        ResourceState::Unknown,
    ];

    /// Operable states plus the soft-deleted state, accepted by expunge
    pub const EXPUNGEABLE_STATES: [ResourceState; 4] = [
        ResourceState::Active,
        ResourceState::Error,
        ResourceState::Unknown,
        ResourceState::Deleted,
    ];

    /// States a container must be in to accept resource operations
    pub const USABLE_CONTAINER_STATES: [ContainerState; 2] =
        [ContainerState::Active, ContainerState::Synchronize];

    /// States from which a container may start a reconciliation run
    pub const SYNCHRONIZABLE_CONTAINER_STATES: [ContainerState; 2] =
        [ContainerState::Active, ContainerState::Error];
}

/// Resource states that are not terminal, used by forced expunge
pub fn non_terminal_resource_states() -> Vec<ResourceState> {
    ResourceState::ALL
        .iter()
        .copied()
        .filter(|state| *state != ResourceState::Expunged)
        .collect()
}

/// Container states that can still be expunged
pub fn expungeable_container_states() -> Vec<ContainerState> {
    ContainerState::ALL
        .iter()
        .copied()
        .filter(|state| {
            !matches!(
                state,
                ContainerState::Expunged | ContainerState::Synchronize | ContainerState::Building
            )
        })
        .collect()
}
