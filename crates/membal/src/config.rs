use std::time::Duration;

use serde::Deserialize;

use crate::{BalanceError, Result, MIB};

/// Tunables of the balancing engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BalancerConfig {
    /// Delay given to ballooning drivers to react to a new target.
    #[serde(with = "millis")]
    pub balloon_delay: Duration,
    /// Iteration cap of a balloon-up request.
    pub balloon_max_tries: u32,
    /// How many delays to wait for free memory before applying one grow request.
    pub balance_retries: u32,
    /// Free hypervisor memory the balancer keeps as a safety margin (bytes).
    pub free_mem_left: u64,
    /// Margin on top of a balloon request that counts as satisfied (bytes).
    pub free_mem_min: u64,
    /// A domain this far below its last target gets its pending grow canceled.
    pub inhibit_tolerance: u64,
    /// Aggregate movement below which a rebalance is considered noise.
    pub min_total_transfer: u64,
    /// Single grow of an under-preferred domain that is always worth doing.
    pub min_change_when_under_pref: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            balloon_delay: Duration::from_millis(100),
            balloon_max_tries: 20,
            balance_retries: 5,
            free_mem_left: 50 * MIB,
            free_mem_min: 25 * MIB,
            inhibit_tolerance: 200 * 1024,
            min_total_transfer: 150 * MIB,
            min_change_when_under_pref: 15 * MIB,
        }
    }
}

impl BalancerConfig {
    /// Tolerance within which a domain counts as having reached its target.
    pub fn target_tolerance(&self) -> u64 {
        self.free_mem_left / 4
    }

    pub fn validate(&self) -> Result<(), BalanceError> {
        if self.free_mem_left == 0 {
            return Err(error_stack::report!(BalanceError::invalid_config(
                "free_mem_left must be greater than zero"
            )));
        }
        if self.free_mem_min > self.free_mem_left {
            return Err(error_stack::report!(BalanceError::invalid_config(
                "free_mem_min must not exceed free_mem_left"
            )));
        }
        if self.balance_retries == 0 {
            return Err(error_stack::report!(BalanceError::invalid_config(
                "balance_retries must be at least 1"
            )));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = BalancerConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.target_tolerance(), 12_800 * 1024);
    }

    #[test]
    fn rejects_margin_inversion() {
        let cfg = BalancerConfig {
            free_mem_min: 60 * MIB,
            ..BalancerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_retries() {
        let cfg = BalancerConfig {
            balance_retries: 0,
            ..BalancerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
