//! # Resource Type Registry
//!
//! Static lookup of [`ResourcePlugin`]s keyed by resource-type tag. The registry is
//! assembled once at startup through [`ResourceTypeRegistryBuilder`] and is immutable
//! afterwards, so lookups need no locking.
//!
//! ## Usage
//!
//! ```rust
//! use cloudmgr_core::registry::ResourceTypeRegistry;
//! use cloudmgr_core::test_helpers::{FakePlatform, FakeResourcePlugin};
//! use std::sync::Arc;
//!
//! # fn example() -> cloudmgr_core::error::CoreResult<()> {
//! let platform = FakePlatform::new();
//! let registry = ResourceTypeRegistry::builder()
//!     .register(Arc::new(FakeResourcePlugin::new("Fake.Server", platform.clone())))?
//!     .build();
//!
//! assert!(registry.get("Fake.Server").is_ok());
//! assert!(registry.get("Fake.Volume").is_err());
//! # Ok(())
//! # }
//! ```

use crate::error::{CoreError, CoreResult};
use crate::plugin::ResourcePlugin;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

#[derive(Default)]
pub struct ResourceTypeRegistry {
    plugins: BTreeMap<String, Arc<dyn ResourcePlugin>>,
}

impl std::fmt::Debug for ResourceTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTypeRegistry")
            .field("resource_types", &self.resource_types())
            .finish()
    }
}

impl ResourceTypeRegistry {
    pub fn builder() -> ResourceTypeRegistryBuilder {
        ResourceTypeRegistryBuilder::default()
    }

    /// Look up the plugin for a resource type
    pub fn get(&self, resource_type: &str) -> CoreResult<Arc<dyn ResourcePlugin>> {
        self.plugins
            .get(resource_type)
            .cloned()
            .ok_or_else(|| CoreError::not_found("resource type", resource_type))
    }

    pub fn contains(&self, resource_type: &str) -> bool {
        self.plugins.contains_key(resource_type)
    }

    /// Registered type tags, sorted
    pub fn resource_types(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }

    /// Plugins whose resources live in containers of `container_type`, sorted by type
    pub fn types_for_container(&self, container_type: &str) -> Vec<Arc<dyn ResourcePlugin>> {
        self.plugins
            .values()
            .filter(|plugin| plugin.container_type() == container_type)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[derive(Default)]
pub struct ResourceTypeRegistryBuilder {
    plugins: BTreeMap<String, Arc<dyn ResourcePlugin>>,
}

impl ResourceTypeRegistryBuilder {
    /// Register a plugin. A type tag can only be registered once.
    pub fn register(mut self, plugin: Arc<dyn ResourcePlugin>) -> CoreResult<Self> {
        let resource_type = plugin.resource_type().to_string();
        if self.plugins.contains_key(&resource_type) {
            return Err(CoreError::Configuration(format!(
                "resource type {resource_type} is already registered"
            )));
        }
        info!(
            resource_type = %resource_type,
            container_type = plugin.container_type(),
            "Registered resource type"
        );
        self.plugins.insert(resource_type, plugin);
        Ok(self)
    }

    pub fn build(self) -> ResourceTypeRegistry {
        ResourceTypeRegistry {
            plugins: self.plugins,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FakePlatform, FakeResourcePlugin};

    #[test]
    fn test_duplicate_registration_rejected() {
        let platform = FakePlatform::new();
        let result = ResourceTypeRegistry::builder()
            .register(Arc::new(FakeResourcePlugin::new("Fake.Server", platform.clone())))
            .unwrap()
            .register(Arc::new(FakeResourcePlugin::new("Fake.Server", platform)));
        assert!(matches!(result, Err(CoreError::Configuration(_))));
    }

    #[test]
    fn test_types_for_container() {
        let platform = FakePlatform::new();
        let registry = ResourceTypeRegistry::builder()
            .register(Arc::new(FakeResourcePlugin::new("Fake.Server", platform.clone())))
            .unwrap()
            .register(Arc::new(FakeResourcePlugin::new("Fake.Network", platform)))
            .unwrap()
            .build();

        let types: Vec<_> = registry
            .types_for_container("Fake")
            .iter()
            .map(|plugin| plugin.resource_type().to_string())
            .collect();
        assert_eq!(types, vec!["Fake.Network", "Fake.Server"]);
        assert!(registry.types_for_container("OpenStack").is_empty());
        assert!(registry.get("Fake.Volume").err().unwrap().is_not_found());
    }
}
