//! Avalanche protection
//!
//! Spreads write TTLs by a uniform relative jitter so that keys written
//! together do not all expire together.

use std::time::Duration;

use rand::Rng;

use crate::config::ProtectionConfig;

/// TTL policy of one cache
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TtlPolicy {
    randomize: bool,
    variance: f64,
}

impl TtlPolicy {
    /// Fixed TTLs
    pub const FIXED: TtlPolicy = TtlPolicy {
        randomize: false,
        variance: 0.0,
    };

    /// Jitter by `variance` (e.g. 0.1 for +/-10%); clamped to `[0, 1)`
    pub fn randomized(variance: f64) -> Self {
        Self {
            randomize: true,
            variance: variance.clamp(0.0, 0.999),
        }
    }

    /// Policy described by a protection config
    pub fn from_config(config: &ProtectionConfig) -> Self {
        if config.ttl_randomization_enabled {
            Self::randomized(config.ttl_variance)
        } else {
            Self::FIXED
        }
    }

    /// `base * (1 + U(-variance, +variance))`, or `base` when fixed
    pub fn compute(&self, base: Duration) -> Duration {
        self.compute_with(base, &mut rand::thread_rng())
    }

    /// As [`TtlPolicy::compute`] with a caller-supplied RNG
    pub fn compute_with<R: Rng + ?Sized>(&self, base: Duration, rng: &mut R) -> Duration {
        if !self.randomize || self.variance == 0.0 || base.is_zero() {
            return base;
        }
        let factor = 1.0 + rng.gen_range(-self.variance..=self.variance);
        let millis = (base.as_millis() as f64 * factor).round().max(1.0);
        Duration::from_millis(millis as u64)
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::from_config(&ProtectionConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_thousand_samples_within_bounds() {
        let policy = TtlPolicy::randomized(0.1);
        let base = Duration::from_millis(1000);
        let mut distinct = std::collections::HashSet::new();
        for _ in 0..1000 {
            let ttl = policy.compute(base);
            assert!(ttl >= Duration::from_millis(900), "{:?} below bound", ttl);
            assert!(ttl <= Duration::from_millis(1100), "{:?} above bound", ttl);
            distinct.insert(ttl);
        }
        // jitter actually spreads the values
        assert!(distinct.len() > 10);
    }

    #[test]
    fn test_fixed_policy() {
        let base = Duration::from_secs(30);
        assert_eq!(TtlPolicy::FIXED.compute(base), base);

        let config = ProtectionConfig {
            ttl_randomization_enabled: false,
            ..ProtectionConfig::default()
        };
        assert_eq!(TtlPolicy::from_config(&config), TtlPolicy::FIXED);
    }

    #[test]
    fn test_zero_base_stays_zero() {
        assert_eq!(TtlPolicy::randomized(0.5).compute(Duration::ZERO), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn prop_ttl_within_variance(base_ms in 1u64..10_000_000, variance in 0.0f64..0.9) {
            let policy = TtlPolicy::randomized(variance);
            let ttl = policy.compute(Duration::from_millis(base_ms)).as_millis() as f64;
            let base = base_ms as f64;
            // one millisecond of rounding slack on either side
            prop_assert!(ttl >= (base * (1.0 - variance)).floor().max(1.0) - 1.0);
            prop_assert!(ttl <= (base * (1.0 + variance)).ceil() + 1.0);
        }
    }
}
