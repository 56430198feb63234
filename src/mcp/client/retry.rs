use std::time::Duration;

use crate::core::config::data::Settings;

/// Exponential backoff with up to 25% random jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.retry_base_delay_ms),
            max_delay: Duration::from_millis(settings.retry_max_delay_ms),
        }
    }

    /// Connect attempts per call; `max_retries` of zero still tries once.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        let jitter_cap = backoff.as_millis() as u64 / 4;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            random_u64() % (jitter_cap + 1)
        };
        (backoff + Duration::from_millis(jitter)).min(self.max_delay)
    }
}

fn random_u64() -> u64 {
    let mut bytes = [0u8; 8];
    match getrandom::fill(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_stay_capped() {
        let policy = RetryPolicy::default();
        let first = policy.delay_for(1);
        assert!(first >= Duration::from_millis(1000) && first <= Duration::from_millis(1250));

        let second = policy.delay_for(2);
        assert!(second >= Duration::from_millis(2000) && second <= Duration::from_millis(2500));

        for retry in 5..40 {
            assert!(policy.delay_for(retry) <= Duration::from_millis(10_000));
        }
    }

    #[test]
    fn zero_base_delay_means_no_wait() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for(3), Duration::ZERO);
        assert_eq!(policy.attempts(), 2);
        assert_eq!(RetryPolicy { max_retries: 0, ..policy }.attempts(), 1);
    }
}
