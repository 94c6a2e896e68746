//! Replacement policy: decides how long a vacant slot waits before the
//! supervisor tries to construct its unit again.

use std::time::Duration;

use rand::Rng;

/// Backoff for failed unit replacements.
#[derive(Debug, Clone)]
pub struct ReplacementPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for a single delay (before jitter).
    pub max_delay: Duration,

    /// Consecutive failures after which the slot is reported as lost.
    /// Retries continue afterwards, at `max_delay`.
    pub max_attempts: u32,

    /// Random extra delay, as a fraction of the computed delay (0.0 disables).
    pub jitter: f64,
}

impl Default for ReplacementPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            jitter: 0.1,
        }
    }
}

impl ReplacementPolicy {
    /// Delay without jitter after `failures` consecutive failures (1-indexed).
    ///
    /// delay = base_delay * multiplier^(failures - 1), capped at `max_delay`.
    ///
    /// Example with base_delay=200ms, multiplier=2.0:
    /// - failure 1: 200ms
    /// - failure 2: 400ms
    /// - failure 3: 800ms
    pub fn base_delay_for(&self, failures: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        // f64::max drops NaN, so a NaN product lands on zero here
        let delay_secs = (base_secs * self.multiplier.powi(exponent)).max(0.0);
        if delay_secs.is_infinite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }

    /// Delay with jitter applied. Jitter outside `0.0..=1.0` is clamped.
    pub fn next_delay(&self, failures: u32) -> Duration {
        let delay = self.base_delay_for(failures);
        if !self.jitter.is_finite() || self.jitter <= 0.0 {
            return delay;
        }
        let jitter = self.jitter.min(1.0);
        let factor = 1.0 + rand::thread_rng().gen_range(0.0..=jitter);
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
    }

    /// Reject values the backoff math cannot use.
    pub fn validate(&self) -> Result<(), String> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!(
                "replacement.multiplier must be a finite number >= 1.0, got {}",
                self.multiplier
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!(
                "replacement.jitter must be within 0.0..=1.0, got {}",
                self.jitter
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(format!(
                "replacement.base_delay ({:?}) must not exceed max_delay ({:?})",
                self.base_delay, self.max_delay
            ));
        }
        if self.max_attempts == 0 {
            return Err("replacement.max_attempts must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Has the slot failed often enough to be reported as lost?
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn no_jitter() -> ReplacementPolicy {
        ReplacementPolicy {
            jitter: 0.0,
            ..ReplacementPolicy::default()
        }
    }

    #[rstest]
    #[case(0, 200)]
    #[case(1, 200)]
    #[case(2, 400)]
    #[case(3, 800)]
    #[case(4, 1600)]
    fn exponential_backoff(#[case] failures: u32, #[case] expected_ms: u64) {
        assert_eq!(
            no_jitter().next_delay(failures),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn delay_is_capped() {
        let policy = no_jitter();
        assert_eq!(policy.next_delay(40), policy.max_delay);
        assert_eq!(policy.next_delay(u32::MAX), policy.max_delay);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = ReplacementPolicy::default();
        for _ in 0..100 {
            let d = policy.next_delay(2);
            assert!(d >= Duration::from_millis(400));
            assert!(d <= Duration::from_millis(441));
        }
    }

    #[rstest]
    #[case::negative_multiplier(-2.0, 0.1)]
    #[case::nan_multiplier(f64::NAN, 0.1)]
    #[case::infinite_multiplier(f64::INFINITY, 0.1)]
    #[case::nan_jitter(2.0, f64::NAN)]
    #[case::infinite_jitter(2.0, f64::INFINITY)]
    #[case::negative_jitter(2.0, -0.5)]
    fn degenerate_values_never_panic(#[case] multiplier: f64, #[case] jitter: f64) {
        let policy = ReplacementPolicy {
            multiplier,
            jitter,
            ..ReplacementPolicy::default()
        };
        assert!(policy.validate().is_err());
        for failures in [1, 2, 3, 40, u32::MAX] {
            assert!(policy.next_delay(failures) <= policy.max_delay.mul_f64(2.0));
        }
    }

    #[test]
    fn huge_max_delay_with_jitter_does_not_overflow() {
        let policy = ReplacementPolicy {
            max_delay: Duration::MAX,
            jitter: 1.0,
            ..ReplacementPolicy::default()
        };
        policy.next_delay(u32::MAX);
    }

    #[test]
    fn default_policy_is_valid() {
        assert!(ReplacementPolicy::default().validate().is_ok());
    }

    #[test]
    fn base_delay_above_cap_is_invalid() {
        let policy = ReplacementPolicy {
            base_delay: Duration::from_secs(60),
            ..ReplacementPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn exhausted_after_max_attempts() {
        let policy = ReplacementPolicy::default();
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
    }
}
