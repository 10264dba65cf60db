//! Timeline direction constant.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::TimelineError;

/// Which end of a segment an operation refers to.
///
/// `Backward` is the start of the segment (older events), `Forward` the end
/// (newer events). On the wire these are the pagination `dir` values `b`/`f`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "b")]
    Backward,
    #[serde(rename = "f")]
    Forward,
}

impl Direction {
    /// Wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Backward => "b",
            Direction::Forward => "f",
        }
    }

    /// The other end.
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Backward => Direction::Forward,
            Direction::Forward => Direction::Backward,
        }
    }
}

impl FromStr for Direction {
    type Err = TimelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "b" => Ok(Direction::Backward),
            "f" => Ok(Direction::Forward),
            other => Err(TimelineError::InvalidDirection(other.to_string())),
        }
    }
}

impl TryFrom<&str> for Direction {
    type Error = TimelineError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wire_values() {
        assert_eq!("b".parse::<Direction>(), Ok(Direction::Backward));
        assert_eq!(Direction::try_from("f"), Ok(Direction::Forward));
    }

    #[test]
    fn test_parse_invalid_direction() {
        assert_eq!(
            "sideways".parse::<Direction>(),
            Err(TimelineError::InvalidDirection("sideways".into()))
        );
    }

    #[test]
    fn test_opposite() {
        assert_eq!(Direction::Backward.opposite(), Direction::Forward);
        assert_eq!(Direction::Forward.opposite(), Direction::Backward);
    }
}
