use serde::{Deserialize, Serialize};
use std::fmt;

/// Resource lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    /// Row inserted, no pipeline has run yet
    Pending,
    /// Remote provisioning in progress
    Building,
    Active,
    /// A mutating operation is in progress
    Updating,
    /// Last operation failed, `last_error` is populated
    Error,
    Deleting,
    /// Soft-deleted, `expiry_date` is set
    Deleted,
    Expunging,
    /// Row removed
    Expunged,
    Unknown,
    /// Administratively frozen
    Disabled,
}

impl ResourceState {
    pub const ALL: [ResourceState; 11] = [
        Self::Pending,
        Self::Building,
        Self::Active,
        Self::Updating,
        Self::Error,
        Self::Deleting,
        Self::Deleted,
        Self::Expunging,
        Self::Expunged,
        Self::Unknown,
        Self::Disabled,
    ];

    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expunged | Self::Disabled)
    }

    /// Check if a new lifecycle operation may start from this state
    pub fn is_operable(&self) -> bool {
        matches!(self, Self::Active | Self::Error | Self::Unknown)
    }

    /// Check if an operation currently holds the resource
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Self::Building | Self::Updating | Self::Deleting | Self::Expunging
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Building => "BUILDING",
            Self::Active => "ACTIVE",
            Self::Updating => "UPDATING",
            Self::Error => "ERROR",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
            Self::Expunging => "EXPUNGING",
            Self::Expunged => "EXPUNGED",
            Self::Unknown => "UNKNOWN",
            Self::Disabled => "DISABLED",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Invalid resource state: {s}"))
    }
}

impl TryFrom<String> for ResourceState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

impl Default for ResourceState {
    fn default() -> Self {
        Self::Pending
    }
}

/// Container lifecycle states: the resource states plus `SYNCHRONIZE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerState {
    Pending,
    /// Connection is being validated by the driver
    Building,
    Active,
    Updating,
    Error,
    Deleting,
    Deleted,
    Expunging,
    Expunged,
    Unknown,
    /// Overrides the ping-derived state
    Disabled,
    /// A reconciliation run owns the container
    Synchronize,
}

impl ContainerState {
    pub const ALL: [ContainerState; 12] = [
        Self::Pending,
        Self::Building,
        Self::Active,
        Self::Updating,
        Self::Error,
        Self::Deleting,
        Self::Deleted,
        Self::Expunging,
        Self::Expunged,
        Self::Unknown,
        Self::Disabled,
        Self::Synchronize,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expunged | Self::Disabled)
    }

    /// Check if resource operations may run against this container
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Active | Self::Synchronize)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Building => "BUILDING",
            Self::Active => "ACTIVE",
            Self::Updating => "UPDATING",
            Self::Error => "ERROR",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
            Self::Expunging => "EXPUNGING",
            Self::Expunged => "EXPUNGED",
            Self::Unknown => "UNKNOWN",
            Self::Disabled => "DISABLED",
            Self::Synchronize => "SYNCHRONIZE",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContainerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Invalid container state: {s}"))
    }
}

impl TryFrom<String> for ContainerState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

impl Default for ContainerState {
    fn default() -> Self {
        Self::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operable_states() {
        let operable: Vec<_> = ResourceState::ALL
            .iter()
            .filter(|state| state.is_operable())
            .collect();
        assert_eq!(
            operable,
            vec![
                &ResourceState::Active,
                &ResourceState::Error,
                &ResourceState::Unknown
            ]
        );
    }

    #[test]
    fn test_error_is_not_terminal() {
        assert!(!ResourceState::Error.is_terminal());
        assert!(ResourceState::Expunged.is_terminal());
        assert!(ResourceState::Disabled.is_terminal());
    }

    #[test]
    fn test_state_string_conversion() {
        assert_eq!(ResourceState::Building.to_string(), "BUILDING");
        assert_eq!(
            "expunging".parse::<ResourceState>().unwrap(),
            ResourceState::Expunging
        );
        assert!("synchronize".parse::<ResourceState>().is_err());
        assert_eq!(
            "SYNCHRONIZE".parse::<ContainerState>().unwrap(),
            ContainerState::Synchronize
        );
    }

    #[test]
    fn test_try_from_string() {
        assert_eq!(
            ResourceState::try_from("ERROR".to_string()).unwrap(),
            ResourceState::Error
        );
        assert_eq!(
            ContainerState::try_from("error".to_string()).unwrap(),
            ContainerState::Error
        );
        assert!(ResourceState::try_from("SYNCHRONIZE".to_string()).is_err());
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&ResourceState::Active).unwrap();
        assert_eq!(json, "\"ACTIVE\"");

        let parsed: ContainerState = serde_json::from_str("\"SYNCHRONIZE\"").unwrap();
        assert_eq!(parsed, ContainerState::Synchronize);
    }

    #[test]
    fn test_every_state_round_trips_through_its_name() {
        for state in ResourceState::ALL {
            assert_eq!(state.as_str().parse::<ResourceState>().unwrap(), state);
        }
        for state in ContainerState::ALL {
            assert_eq!(state.as_str().parse::<ContainerState>().unwrap(), state);
        }
    }
}
