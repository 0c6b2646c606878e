pub mod payload;
pub mod publisher;

// Re-export key types for convenience
pub use payload::TransitionPayload;
pub use publisher::{EventPublisher, EventPublisherStats, PublishError, PublishedEvent};
