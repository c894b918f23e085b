//! CPU quota values and the quota state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ReconcileError;

/// CPU-time entitlement of the colocated batch work, in percent.
///
/// `0` means fully throttled (realised by pausing), `100` means
/// unrestricted. Values in between are a share of the batch containers'
/// cpuset capacity per accounting period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Quota(pub(crate) u8);

impl Quota {
    pub const ZERO: Quota = Quota(0);
    pub const MAX: Quota = Quota(100);

    /// Create a quota, rejecting values above 100.
    pub fn new(percent: u32) -> Result<Self, ReconcileError> {
        if percent > 100 {
            return Err(ReconcileError::QuotaOutOfRange(percent));
        }
        Ok(Self(percent as u8))
    }

    pub fn percent(self) -> u32 {
        u32::from(self.0)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_max(self) -> bool {
        self == Self::MAX
    }

    /// Runtime `CpuQuota` for `cores` cores at the given period.
    ///
    /// Returns `-1` (no limit) for the maximum quota.
    pub fn cpu_quota_us(self, period_us: u64, cores: usize) -> i64 {
        if self.is_max() {
            return -1;
        }
        let capacity = period_us.saturating_mul(cores.max(1) as u64);
        (capacity * u64::from(self.0) / 100) as i64
    }
}

impl TryFrom<u32> for Quota {
    type Error = ReconcileError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Quota> for u32 {
    fn from(quota: Quota) -> Self {
        quota.percent()
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// What applying a new quota requires of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaTransition {
    /// Target equals the current quota.
    Unchanged,
    /// Quota drops to zero: pause the colocated work.
    Pause,
    /// Quota leaves zero: resume the colocated work.
    Resume,
    /// Quota moves between two non-zero values.
    Adjust,
}

impl QuotaTransition {
    pub fn is_unchanged(self) -> bool {
        matches!(self, Self::Unchanged)
    }
}

/// Current and previous quota of the colocated work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaState {
    current: Quota,
    previous: Quota,
}

impl QuotaState {
    pub fn new(initial: Quota) -> Self {
        Self {
            current: initial,
            previous: initial,
        }
    }

    pub fn current(&self) -> Quota {
        self.current
    }

    pub fn previous(&self) -> Quota {
        self.previous
    }

    /// Classify the move from the current quota to `target`.
    pub fn transition_to(&self, target: Quota) -> QuotaTransition {
        if target == self.current {
            QuotaTransition::Unchanged
        } else if target.is_zero() {
            QuotaTransition::Pause
        } else if self.current.is_zero() {
            QuotaTransition::Resume
        } else {
            QuotaTransition::Adjust
        }
    }

    /// Record `target` as applied.
    pub fn commit(&mut self, target: Quota) {
        if target != self.current {
            self.previous = self.current;
            self.current = target;
        }
    }
}

impl Default for QuotaState {
    fn default() -> Self {
        Self::new(Quota::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_bounds() {
        assert!(Quota::new(0).is_ok());
        assert!(Quota::new(100).is_ok());
        assert_eq!(Quota::new(101), Err(ReconcileError::QuotaOutOfRange(101)));
    }

    #[test]
    fn test_cpu_quota_us() {
        assert_eq!(Quota::MAX.cpu_quota_us(100_000, 2), -1);
        assert_eq!(Quota::new(50).unwrap().cpu_quota_us(100_000, 2), 100_000);
        assert_eq!(Quota::new(10).unwrap().cpu_quota_us(100_000, 1), 10_000);
        assert_eq!(Quota::ZERO.cpu_quota_us(100_000, 3), 0);
    }

    #[test]
    fn test_transitions() {
        let mut state = QuotaState::default();
        assert_eq!(state.transition_to(Quota::MAX), QuotaTransition::Unchanged);
        assert_eq!(state.transition_to(Quota::ZERO), QuotaTransition::Pause);

        state.commit(Quota::ZERO);
        assert_eq!(state.previous(), Quota::MAX);
        assert_eq!(state.transition_to(Quota::ZERO), QuotaTransition::Unchanged);
        assert_eq!(state.transition_to(Quota::new(30).unwrap()), QuotaTransition::Resume);

        state.commit(Quota::new(30).unwrap());
        assert_eq!(state.transition_to(Quota::MAX), QuotaTransition::Adjust);
    }

    #[test]
    fn test_commit_same_value_keeps_previous() {
        let mut state = QuotaState::default();
        state.commit(Quota::ZERO);
        state.commit(Quota::ZERO);
        assert_eq!(state.previous(), Quota::MAX);
        assert_eq!(state.current(), Quota::ZERO);
    }

    #[test]
    fn test_serde_rejects_out_of_range() {
        assert!(serde_json::from_str::<Quota>("150").is_err());
        assert_eq!(serde_json::from_str::<Quota>("35").unwrap().percent(), 35);
    }
}
