//! Checkpoint levels, return tokens and staging states.

use std::fmt;

use serde::{Deserialize, Serialize};
use stratum_error::{Result, StratumError};

/// Storage tier with monotonically increasing durability and cost.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Level {
    /// Local copy on the node-local filesystem.
    L1,
    /// Partner copy across node pairs in the group ring.
    L2,
    /// Reed-Solomon encoded group.
    L3,
    /// Parallel-filesystem flush.
    L4,
}

impl Level {
    /// All levels, cheapest first. Recovery precedence follows this order.
    pub const ALL: [Self; 4] = [Self::L1, Self::L2, Self::L3, Self::L4];

    /// 1-based level number as used in file and directory names.
    #[must_use]
    pub const fn number(self) -> u32 {
        match self {
            Self::L1 => 1,
            Self::L2 => 2,
            Self::L3 => 3,
            Self::L4 => 4,
        }
    }

    /// 0-based index for per-level state arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        self.number() as usize - 1
    }

    /// Directory component (`l1` .. `l4`).
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::L1 => "l1",
            Self::L2 => "l2",
            Self::L3 => "l3",
            Self::L4 => "l4",
        }
    }

    /// Parse a 1-based level number.
    pub fn from_number(n: u32) -> Result<Self> {
        match n {
            1 => Ok(Self::L1),
            2 => Ok(Self::L2),
            3 => Ok(Self::L3),
            4 => Ok(Self::L4),
            other => Err(StratumError::OutOfRange {
                what: "checkpoint level".to_owned(),
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.number())
    }
}

/// Return tokens of the public operations, with the wire-stable codes
/// external tooling expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusToken {
    /// Operation succeeded.
    Sces,
    /// A checkpoint was performed.
    Done,
    /// This process is a head returning to user code.
    Head,
    /// Generic failure.
    Nscs,
    /// Recovery failed on every level.
    Nrec,
}

impl StatusToken {
    /// Numeric code: `SCES=0`, `DONE=1`, `HEAD=2`, `NSCS=-1`, `NREC=-2`.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Sces => 0,
            Self::Done => 1,
            Self::Head => 2,
            Self::Nscs => -1,
            Self::Nrec => -2,
        }
    }
}

/// Lifecycle of one staging request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageState {
    /// Slot never used.
    NotInitialized,
    /// Queued, not yet picked up.
    Pending,
    /// Transfer in flight.
    Active,
    /// Transfer completed and fsynced.
    Success,
    /// Transfer failed; source left in place.
    Failed,
}

impl StageState {
    /// Numeric code matching the on-wire status byte
    /// (`NINI=0x0, PEND=0x1, ACTV=0x2, SCES=0x3, FAIL=0x4`).
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::NotInitialized => 0x0,
            Self::Pending => 0x1,
            Self::Active => 0x2,
            Self::Success => 0x3,
            Self::Failed => 0x4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_numbers_round_trip() {
        for level in Level::ALL {
            assert_eq!(Level::from_number(level.number()).unwrap(), level);
        }
        assert!(Level::from_number(0).is_err());
        assert!(Level::from_number(5).is_err());
    }

    #[test]
    fn test_level_order_matches_recovery_precedence() {
        assert!(Level::L1 < Level::L2);
        assert!(Level::L2 < Level::L3);
        assert!(Level::L3 < Level::L4);
    }

    #[test]
    fn test_status_token_codes() {
        assert_eq!(StatusToken::Sces.code(), 0);
        assert_eq!(StatusToken::Done.code(), 1);
        assert_eq!(StatusToken::Head.code(), 2);
        assert_eq!(StatusToken::Nscs.code(), -1);
        assert_eq!(StatusToken::Nrec.code(), -2);
    }

    #[test]
    fn test_stage_state_codes() {
        assert_eq!(StageState::NotInitialized.code(), 0x0);
        assert_eq!(StageState::Pending.code(), 0x1);
        assert_eq!(StageState::Active.code(), 0x2);
        assert_eq!(StageState::Success.code(), 0x3);
        assert_eq!(StageState::Failed.code(), 0x4);
    }
}
