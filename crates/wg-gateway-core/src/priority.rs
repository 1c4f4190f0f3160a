//! VRRP priority from routing state
//!
//! The VRRP priority is never configured on its own: it is a function of
//! how many advertised prefixes are currently reachable through OSPF. A
//! gateway without a single reachable prefix always drops to the minimum
//! so it cannot hold mastership.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Highest priority keepalived accepts for a backup instance
pub const MAX_VRRP_PRIORITY: u8 = 254;

/// Tunable priority weighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityPolicy {
    /// Priority with one reachable prefix, minus `per_prefix`
    pub base: u8,
    /// Added for every reachable prefix
    pub per_prefix: u8,
    /// Floor, and the value used with zero reachable prefixes
    pub min: u8,
    /// Ceiling
    pub max: u8,
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self {
            base: 100,
            per_prefix: 10,
            min: 1,
            max: MAX_VRRP_PRIORITY,
        }
    }
}

impl PriorityPolicy {
    /// Require `1 <= min < base <= max <= 254`
    pub fn validate(&self) -> Result<()> {
        if self.min == 0 {
            return Err(Error::InvalidPolicy("priority min must be at least 1".into()));
        }
        if self.base <= self.min {
            return Err(Error::InvalidPolicy(format!(
                "priority base {} must exceed min {}",
                self.base, self.min
            )));
        }
        if self.max < self.base || self.max > MAX_VRRP_PRIORITY {
            return Err(Error::InvalidPolicy(format!(
                "priority max {} must be within [{}, {}]",
                self.max, self.base, MAX_VRRP_PRIORITY
            )));
        }
        Ok(())
    }

    /// Priority for a number of reachable prefixes
    pub fn priority(&self, reachable: usize) -> u8 {
        if reachable == 0 {
            return self.min;
        }
        let bonus = u64::from(self.per_prefix).saturating_mul(reachable as u64);
        let raw = u64::from(self.base).saturating_add(bonus);
        raw.clamp(u64::from(self.min), u64::from(self.max)) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base: u8, per_prefix: u8, min: u8, max: u8) -> PriorityPolicy {
        PriorityPolicy {
            base,
            per_prefix,
            min,
            max,
        }
    }

    #[test]
    fn test_zero_is_minimum() {
        let policy = PriorityPolicy::default();
        assert_eq!(policy.priority(0), policy.min);
        assert!(policy.priority(1) > policy.min);
    }

    #[test]
    fn test_monotonic() {
        let policies = [
            PriorityPolicy::default(),
            policy(2, 0, 1, 2),
            policy(200, 255, 50, 254),
        ];
        for p in policies {
            p.validate().unwrap();
            let mut previous = p.priority(0);
            for n in 1..500 {
                let current = p.priority(n);
                assert!(current >= previous, "{:?} dropped at {}", p, n);
                assert!(current <= p.max);
                previous = current;
            }
        }
    }

    #[test]
    fn test_saturates_at_max() {
        let policy = PriorityPolicy::default();
        assert_eq!(policy.priority(10_000), MAX_VRRP_PRIORITY);
        assert_eq!(policy.priority(usize::MAX), MAX_VRRP_PRIORITY);
    }

    #[test]
    fn test_validation() {
        assert!(policy(100, 10, 0, 254).validate().is_err());
        assert!(policy(1, 10, 1, 254).validate().is_err());
        assert!(policy(100, 10, 1, 255).validate().is_err());
        assert!(policy(100, 10, 1, 50).validate().is_err());
    }
}
