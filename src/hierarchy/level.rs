//! Level ordering along parent edges

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Which edge a level comparison belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelInvariant {
    /// Position below its parent position
    Position,
    /// Employee's position below the manager's position
    Manager,
}

impl fmt::Display for LevelInvariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LevelInvariant::Position => f.write_str("parent position"),
            LevelInvariant::Manager => f.write_str("manager's position"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("level {candidate} must be lower than the {invariant} level {upper}")]
pub struct LevelError {
    pub invariant: LevelInvariant,
    pub candidate: i32,
    pub upper: i32,
}

impl LevelInvariant {
    /// The candidate must rank strictly below the upper level, if any
    pub fn validate(self, candidate: i32, upper: Option<i32>) -> Result<(), LevelError> {
        match upper {
            Some(upper) if candidate >= upper => Err(LevelError {
                invariant: self,
                candidate,
                upper,
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_parent_is_valid() {
        assert!(LevelInvariant::Position.validate(99, None).is_ok());
    }

    #[test]
    fn test_equal_level_rejected_then_lower_accepted() {
        let err = LevelInvariant::Position.validate(5, Some(5)).unwrap_err();
        assert_eq!(err.candidate, 5);
        assert_eq!(err.upper, 5);
        assert!(LevelInvariant::Position.validate(3, Some(5)).is_ok());
    }

    #[test]
    fn test_manager_message() {
        let err = LevelInvariant::Manager.validate(7, Some(4)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "level 7 must be lower than the manager's position level 4"
        );
    }
}
