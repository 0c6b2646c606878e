use crate::error::{CoreError, CoreResult};
use crate::plugin::ContainerDriver;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Container drivers keyed by container type, frozen at startup
#[derive(Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, Arc<dyn ContainerDriver>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("container_types", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DriverRegistry {
    pub fn builder() -> DriverRegistryBuilder {
        DriverRegistryBuilder::default()
    }

    pub fn get(&self, container_type: &str) -> CoreResult<Arc<dyn ContainerDriver>> {
        self.drivers
            .get(container_type)
            .cloned()
            .ok_or_else(|| CoreError::not_found("container driver", container_type))
    }

    /// Driver for a `(container_type, implementation_class)` pair
    pub fn resolve(
        &self,
        container_type: &str,
        implementation_class: &str,
    ) -> CoreResult<Arc<dyn ContainerDriver>> {
        let driver = self.get(container_type)?;
        if driver.implementation_class() != implementation_class {
            return Err(CoreError::Validation(format!(
                "container type {container_type} is implemented by {}, not {implementation_class}",
                driver.implementation_class()
            )));
        }
        Ok(driver)
    }

    pub fn container_types(&self) -> Vec<&str> {
        self.drivers.keys().map(String::as_str).collect()
    }
}

#[derive(Default)]
pub struct DriverRegistryBuilder {
    drivers: BTreeMap<String, Arc<dyn ContainerDriver>>,
}

impl DriverRegistryBuilder {
    pub fn register(mut self, driver: Arc<dyn ContainerDriver>) -> CoreResult<Self> {
        let container_type = driver.container_type().to_string();
        if self.drivers.contains_key(&container_type) {
            return Err(CoreError::Configuration(format!(
                "container driver for {container_type} is already registered"
            )));
        }
        info!(container_type = %container_type, "Registered container driver");
        self.drivers.insert(container_type, driver);
        Ok(self)
    }

    pub fn build(self) -> DriverRegistry {
        DriverRegistry {
            drivers: self.drivers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FakeDriver, FakePlatform};

    #[test]
    fn test_resolve_checks_implementation_class() {
        let registry = DriverRegistry::builder()
            .register(Arc::new(FakeDriver::new(FakePlatform::new())))
            .unwrap()
            .build();

        assert!(registry.resolve("Fake", FakeDriver::IMPLEMENTATION_CLASS).is_ok());
        assert!(matches!(
            registry.resolve("Fake", "other::Driver"),
            Err(CoreError::Validation(_))
        ));
        assert!(registry.get("OpenStack").err().unwrap().is_not_found());
    }
}
