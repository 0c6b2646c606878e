use crate::config::ReconciliationConfig;
use serde::{Deserialize, Serialize};

/// Which reconciliation passes to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    pub discover_new: bool,
    pub discover_died: bool,
    pub discover_changed: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_config(&ReconciliationConfig::default())
    }
}

impl SyncOptions {
    pub fn from_config(config: &ReconciliationConfig) -> Self {
        Self {
            discover_new: config.discover_new,
            discover_died: config.discover_died,
            discover_changed: config.discover_changed,
        }
    }

    pub fn only_new() -> Self {
        Self {
            discover_new: true,
            discover_died: false,
            discover_changed: false,
        }
    }
}

/// Parameters of a container-level reconciliation run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Empty means every type registered for the container type
    #[serde(default)]
    pub resource_types: Vec<String>,
    pub ext_id_hint: Option<String>,
    pub options: Option<SyncOptions>,
    /// Run inline instead of on the worker pool
    #[serde(default)]
    pub sync: bool,
}

/// A resource touched by reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciledEntity {
    pub resource_type: String,
    pub ext_id: String,
    pub name: String,
    pub resource_id: Option<i64>,
}

/// A per-entity failure; the run continues past it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationFailure {
    pub resource_type: String,
    pub ext_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub new: Vec<ReconciledEntity>,
    pub died: Vec<ReconciledEntity>,
    pub changed: Vec<ReconciledEntity>,
    pub errors: Vec<ReconciliationFailure>,
}

impl ReconciliationReport {
    pub fn merge(&mut self, other: ReconciliationReport) {
        self.new.extend(other.new);
        self.died.extend(other.died);
        self.changed.extend(other.changed);
        self.errors.extend(other.errors);
    }

    /// No differences found between local and remote inventory
    pub fn is_clean(&self) -> bool {
        self.new.is_empty() && self.died.is_empty() && self.changed.is_empty()
    }

    pub(crate) fn record_error(
        &mut self,
        resource_type: &str,
        ext_id: &str,
        error: impl ToString,
    ) {
        self.errors.push(ReconciliationFailure {
            resource_type: resource_type.to_string(),
            ext_id: ext_id.to_string(),
            error: error.to_string(),
        });
    }
}
