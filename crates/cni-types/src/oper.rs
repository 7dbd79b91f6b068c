//! Operational state of a kernel link.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operational state as reported in `IFLA_OPERSTATE` (RFC 2863 naming).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperState {
    #[default]
    Unknown,
    NotPresent,
    Down,
    LowerLayerDown,
    Testing,
    Dormant,
    Up,
}

impl OperState {
    /// Returns true if the link is forwarding traffic.
    pub const fn is_up(&self) -> bool {
        matches!(self, OperState::Up)
    }

    /// Maps the raw kernel value, treating anything unrecognised as unknown.
    pub const fn from_kernel(value: u8) -> Self {
        match value {
            1 => OperState::NotPresent,
            2 => OperState::Down,
            3 => OperState::LowerLayerDown,
            4 => OperState::Testing,
            5 => OperState::Dormant,
            6 => OperState::Up,
            _ => OperState::Unknown,
        }
    }
}

impl fmt::Display for OperState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperState::Unknown => "unknown",
            OperState::NotPresent => "notpresent",
            OperState::Down => "down",
            OperState::LowerLayerDown => "lowerlayerdown",
            OperState::Testing => "testing",
            OperState::Dormant => "dormant",
            OperState::Up => "up",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for OperState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unknown" => Ok(OperState::Unknown),
            "notpresent" => Ok(OperState::NotPresent),
            "down" => Ok(OperState::Down),
            "lowerlayerdown" => Ok(OperState::LowerLayerDown),
            "testing" => Ok(OperState::Testing),
            "dormant" => Ok(OperState::Dormant),
            "up" => Ok(OperState::Up),
            _ => Err(ParseError::InvalidOperState(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_kernel() {
        assert_eq!(OperState::from_kernel(6), OperState::Up);
        assert_eq!(OperState::from_kernel(2), OperState::Down);
        assert_eq!(OperState::from_kernel(0), OperState::Unknown);
        assert_eq!(OperState::from_kernel(42), OperState::Unknown);
    }

    #[test]
    fn test_display_matches_parse() {
        for state in [
            OperState::Unknown,
            OperState::NotPresent,
            OperState::Down,
            OperState::LowerLayerDown,
            OperState::Testing,
            OperState::Dormant,
            OperState::Up,
        ] {
            assert_eq!(state.to_string().parse::<OperState>().unwrap(), state);
        }
    }

    #[test]
    fn test_only_up_is_up() {
        assert!(OperState::Up.is_up());
        assert!(!OperState::Dormant.is_up());
        assert!(!OperState::default().is_up());
    }

    #[test]
    fn test_invalid() {
        assert!("sideways".parse::<OperState>().is_err());
    }
}
