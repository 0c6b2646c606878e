//! # Error Taxonomy
//!
//! Every public operation of the control plane returns [`CoreResult`]. Errors raised by
//! the lower layers (persistence gateway, transition table, configuration loader) are
//! folded into [`CoreError`] through `From` conversions so `?` works across layers.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// Wrong state for the requested operation, or children present on delete/expunge
    #[error("Conflict on {entity} {key}: {reason}")]
    Conflict {
        entity: String,
        key: String,
        reason: String,
    },

    #[error("{entity} {key} not found")]
    NotFound { entity: String, key: String },

    #[error("Operation {operation} on {objtype} {objid} is not authorized")]
    AuthorizationDenied {
        objtype: String,
        objid: String,
        operation: String,
    },

    /// A persistence gateway write failed
    #[error("Transaction failure during {operation}: {reason}")]
    TransactionFailure { operation: String, reason: String },

    /// A business step failed against the remote platform
    #[error("Remote provisioning of {resource_type} failed: {reason}")]
    RemoteProvisioningFailure {
        resource_type: String,
        reason: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn conflict(
        entity: impl Into<String>,
        key: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            entity: entity.into(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>, key: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.into(),
            key: key.to_string(),
        }
    }

    pub fn transaction(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::TransactionFailure {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn remote(resource_type: impl Into<String>, reason: impl ToString) -> Self {
        Self::RemoteProvisioningFailure {
            resource_type: resource_type.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Errors detected before any state mutation. They surface to the caller without
    /// the failure handler touching the resource.
    pub fn is_pre_mutation(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. }
                | Self::NotFound { .. }
                | Self::AuthorizationDenied { .. }
                | Self::Validation(_)
        )
    }

    /// Only persistence hiccups are worth re-running a step for
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransactionFailure { .. })
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(error: serde_json::Error) -> Self {
        CoreError::Serialization(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_mutation_classification() {
        assert!(CoreError::conflict("resource", 1, "busy").is_pre_mutation());
        assert!(CoreError::not_found("resource", "abc").is_pre_mutation());
        assert!(CoreError::Validation("bad".into()).is_pre_mutation());
        assert!(!CoreError::transaction("update", "disk full").is_pre_mutation());
        assert!(!CoreError::remote("Fake.Server", "timeout").is_pre_mutation());
    }

    #[test]
    fn test_only_transaction_failures_are_retryable() {
        assert!(CoreError::transaction("update", "deadlock").is_retryable());
        assert!(!CoreError::remote("Fake.Server", "boom").is_retryable());
        assert!(!CoreError::conflict("resource", 1, "busy").is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::conflict("resource", 42, "state BUILDING is not operable");
        assert_eq!(
            err.to_string(),
            "Conflict on resource 42: state BUILDING is not operable"
        );
    }
}
