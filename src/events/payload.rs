//! Payload published with every state-change event.
//!
//! Subscribers receive the same field set regardless of whether a resource or a
//! container moved, so one consumer can follow both streams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionPayload {
    pub id: i64,
    pub uuid: Uuid,
    pub objid: String,
    /// `None` for unconditional writes where the previous state was not read
    pub from: Option<String>,
    pub to: String,
    pub event: Option<String>,
    pub last_error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TransitionPayload {
    pub fn new(id: i64, uuid: Uuid, objid: impl Into<String>, to: impl ToString) -> Self {
        Self {
            id,
            uuid,
            objid: objid.into(),
            from: None,
            to: to.to_string(),
            event: None,
            last_error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_from(mut self, from: impl ToString) -> Self {
        self.from = Some(from.to_string());
        self
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_last_error(mut self, last_error: Option<String>) -> Self {
        self.last_error = last_error;
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_fields() {
        let value = TransitionPayload::new(3, Uuid::nil(), "c//r", "ERROR")
            .with_from("BUILDING")
            .with_event("fail")
            .with_last_error(Some("timeout".to_string()))
            .to_value();

        assert_eq!(value["id"], 3);
        assert_eq!(value["from"], "BUILDING");
        assert_eq!(value["to"], "ERROR");
        assert_eq!(value["last_error"], "timeout");
    }
}
