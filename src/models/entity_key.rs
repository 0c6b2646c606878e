use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lookup key accepted wherever an entity is addressed by the caller: internal id,
/// UUID, or name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EntityKey {
    Id(i64),
    Uuid(Uuid),
    Name(String),
}

impl FromStr for EntityKey {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(id) = s.parse::<i64>() {
            return Ok(Self::Id(id));
        }
        if let Ok(uuid) = Uuid::parse_str(s) {
            return Ok(Self::Uuid(uuid));
        }
        Ok(Self::Name(s.to_string()))
    }
}

impl From<i64> for EntityKey {
    fn from(id: i64) -> Self {
        Self::Id(id)
    }
}

impl From<Uuid> for EntityKey {
    fn from(uuid: Uuid) -> Self {
        Self::Uuid(uuid)
    }
}

impl From<&str> for EntityKey {
    fn from(value: &str) -> Self {
        match value.parse() {
            Ok(key) => key,
            Err(never) => match never {},
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Uuid(uuid) => write!(f, "{uuid}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_kinds() {
        assert_eq!(EntityKey::from("42"), EntityKey::Id(42));
        let uuid = Uuid::new_v4();
        assert_eq!(EntityKey::from(uuid.to_string().as_str()), EntityKey::Uuid(uuid));
        assert_eq!(
            EntityKey::from("web-server-01"),
            EntityKey::Name("web-server-01".to_string())
        );
    }
}
