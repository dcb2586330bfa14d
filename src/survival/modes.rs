//! Mode Classification
//!
//! Maps wallet balances to an operating mode. Gas dominates: without gas
//! no call is affordable regardless of the stable balance, so the agent
//! drops straight to Emergency. The death condition is separate from
//! classification and is checked every cycle.

use crate::config::SurvivalThresholds;
use crate::types::{Balances, OperatingMode};

/// Classify balances into an operating mode.
///
/// Checks run in order: gas floor, hibernation floor, emergency floor,
/// low-power floor. For a fixed gas balance the result degrades
/// monotonically as the stable balance falls.
pub fn classify(balances: &Balances, thresholds: &SurvivalThresholds) -> OperatingMode {
    if balances.gas < thresholds.min_gas {
        return OperatingMode::Emergency;
    }
    if balances.stable < thresholds.hibernation_floor {
        return OperatingMode::Hibernation;
    }
    if balances.stable < thresholds.emergency_floor {
        return OperatingMode::Emergency;
    }
    if balances.stable < thresholds.low_power_floor {
        return OperatingMode::LowPower;
    }
    OperatingMode::Normal
}

/// The death condition: both resources exhausted at once. A low stable
/// balance alone means hibernation; a dead agent can afford neither calls
/// nor the fees to receive help.
pub fn is_death(balances: &Balances, thresholds: &SurvivalThresholds) -> bool {
    balances.stable < thresholds.hibernation_floor && balances.gas < thresholds.min_gas
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balances(gas: f64, stable: f64) -> Balances {
        Balances { gas, stable }
    }

    #[test]
    fn test_classification_tiers() {
        let t = SurvivalThresholds::default();
        assert_eq!(classify(&balances(0.1, 10.0), &t), OperatingMode::Normal);
        assert_eq!(classify(&balances(0.1, 3.0), &t), OperatingMode::LowPower);
        assert_eq!(classify(&balances(0.1, 1.0), &t), OperatingMode::Emergency);
        assert_eq!(classify(&balances(0.1, 0.2), &t), OperatingMode::Hibernation);
    }

    #[test]
    fn test_gas_exhaustion_dominates() {
        let t = SurvivalThresholds::default();
        // Plenty of stable, no gas: every call is unaffordable.
        assert_eq!(classify(&balances(0.0001, 50.0), &t), OperatingMode::Emergency);
    }

    #[test]
    fn test_degradation_is_monotonic_in_stable_balance() {
        let t = SurvivalThresholds::default();
        let mut last_rank = 0u8;
        let mut stable = 30.0;
        while stable > 0.0 {
            let rank = classify(&balances(0.1, stable), &t).degradation();
            assert!(
                rank >= last_rank,
                "mode improved from rank {last_rank} to {rank} as stable fell to {stable}"
            );
            last_rank = rank;
            stable -= 0.01;
        }
    }

    #[test]
    fn test_death_requires_both_exhausted() {
        let t = SurvivalThresholds::default();
        assert!(is_death(&balances(0.0001, 0.2), &t));
        // Stable below the floor but gas remaining: hibernation, not death.
        assert!(!is_death(&balances(0.1, 0.2), &t));
        // Gas gone but stable above the floor: emergency, not death.
        assert!(!is_death(&balances(0.0001, 5.0), &t));
    }

    #[test]
    fn test_floor_boundaries_are_exclusive() {
        let t = SurvivalThresholds::default();
        // Exactly at a floor stays in the better mode.
        assert_eq!(
            classify(&balances(0.1, t.low_power_floor), &t),
            OperatingMode::Normal
        );
        assert_eq!(
            classify(&balances(0.1, t.hibernation_floor), &t),
            OperatingMode::Emergency
        );
        assert!(!is_death(&balances(0.0, t.hibernation_floor), &t));
    }
}
