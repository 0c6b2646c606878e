use serde::{Deserialize, Serialize};

/// Events that can trigger resource state transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ResourceEvent {
    /// Start provisioning a freshly inserted resource (create/import)
    Build,
    /// Start a mutating operation (update/patch/action)
    Update,
    /// Provisioning or mutation finished
    Complete,
    /// Operation failed with error message
    Fail(String),
    /// Start a soft delete
    Delete,
    /// Soft delete finished
    SoftDelete,
    /// Start a hard delete; `force` accepts any non-terminal state
    Expunge { force: bool },
    /// Hard delete finished
    Expunged,
    Disable,
    Enable,
}

impl ResourceEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Update => "update",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::Delete => "delete",
            Self::SoftDelete => "soft_delete",
            Self::Expunge { .. } => "expunge",
            Self::Expunged => "expunged",
            Self::Disable => "disable",
            Self::Enable => "enable",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    /// Create a failure event with the given error message
    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }
}

/// Events that can trigger container state transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ContainerEvent {
    /// Start validating the connection
    Build,
    /// Start reconfiguring the connection
    Update,
    /// Start a reconciliation run
    Synchronize,
    /// Validation, update or reconciliation finished
    Complete,
    Fail(String),
    Expunge { force: bool },
    Expunged,
    Disable,
    Enable,
}

impl ContainerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Update => "update",
            Self::Synchronize => "synchronize",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::Expunge { .. } => "expunge",
            Self::Expunged => "expunged",
            Self::Disable => "disable",
            Self::Enable => "enable",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serde_shape() {
        let json = serde_json::to_value(ResourceEvent::fail_with_error("boom")).unwrap();
        assert_eq!(json["type"], "Fail");
        assert_eq!(json["data"], "boom");

        let json = serde_json::to_value(ContainerEvent::Expunge { force: true }).unwrap();
        assert_eq!(json["data"]["force"], true);
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            ResourceEvent::fail_with_error("remote timeout").error_message(),
            Some("remote timeout")
        );
        assert_eq!(ResourceEvent::Complete.error_message(), None);
        assert_eq!(ContainerEvent::Synchronize.event_type(), "synchronize");
    }
}
