pub mod container;
pub mod entity_key;
pub mod job;
pub mod objid;
pub mod resource;
pub mod resource_link;
pub mod resource_tag;

// Re-export core models for easy access
pub use container::{Container, ContainerFilter, ContainerUpdate, NewContainer};
pub use entity_key::EntityKey;
pub use job::{Job, JobFilter, NewJob};
pub use resource::{merge_attribute, NewResource, Resource, ResourceFilter, ResourceUpdate};
pub use resource_link::{LinkDirection, LinkFilter, LinkedResource, NewResourceLink, ResourceLink};
pub use resource_tag::{ResourceTag, TagTarget};
