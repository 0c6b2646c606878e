use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Tag value shared by any number of resources and links
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ResourceTag {
    pub id: i64,
    pub value: String,
    pub created_at: DateTime<Utc>,
}

/// Entity a tag is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TagTarget {
    Resource(i64),
    Link(i64),
}

impl TagTarget {
    pub fn id(&self) -> i64 {
        match self {
            Self::Resource(id) | Self::Link(id) => *id,
        }
    }
}
