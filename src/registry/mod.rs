//! # Registries
//!
//! Startup-time lookup tables for backend integrations: resource-type plugins and
//! container drivers.

pub mod drivers;
pub mod resource_types;

pub use drivers::{DriverRegistry, DriverRegistryBuilder};
pub use resource_types::{ResourceTypeRegistry, ResourceTypeRegistryBuilder};
