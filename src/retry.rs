//! Retry backoff schedule.

use rand::Rng;
use std::time::Duration;

use crate::config::EffectiveConfig;

/// Largest fraction of a wait that jitter adds or removes.
pub const JITTER_FACTOR: f64 = 0.5;

/// Policy for retrying failed invocations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    /// No retries - fail after the first attempt.
    #[default]
    None,

    /// Doubling backoff between retries.
    Exponential {
        /// Maximum number of retries after the first attempt.
        max_retries: u32,
        /// Wait before the first retry (doubles each retry).
        initial_delay: Duration,
        /// Maximum delay cap.
        max_delay: Duration,
        /// Randomize each wait by up to [`JITTER_FACTOR`].
        jitter: bool,
    },
}

impl RetryPolicy {
    /// Create a doubling policy.
    pub fn exponential(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        if max_retries == 0 {
            return Self::None;
        }
        Self::Exponential {
            max_retries,
            initial_delay,
            max_delay,
            jitter: false,
        }
    }

    /// Spread waits randomly around the doubling schedule.
    pub fn with_jitter(self, enabled: bool) -> Self {
        match self {
            Self::None => Self::None,
            Self::Exponential {
                max_retries,
                initial_delay,
                max_delay,
                ..
            } => Self::Exponential {
                max_retries,
                initial_delay,
                max_delay,
                jitter: enabled,
            },
        }
    }

    /// Derive the policy a step runs with.
    pub fn from_config(config: &EffectiveConfig) -> Self {
        Self::exponential(
            config.retry_limit(),
            config.retry_wait(),
            config.max_backoff(),
        )
        .with_jitter(config.jitter())
    }

    /// The unjittered wait before retry number `retry` (1-indexed).
    ///
    /// Returns `None` once the retry budget is spent.
    pub fn base_delay(&self, retry: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Exponential {
                max_retries,
                initial_delay,
                max_delay,
                ..
            } => {
                if retry == 0 || retry > *max_retries {
                    return None;
                }
                // 2^(retry-1) * initial_delay, capped at max_delay
                let multiplier = 2u32.saturating_pow(retry - 1);
                Some(initial_delay.saturating_mul(multiplier).min(*max_delay))
            }
        }
    }

    /// Calculate the wait before retry number `retry` (1-indexed).
    ///
    /// With jitter the base wait is scaled by a random factor in
    /// `[1 - JITTER_FACTOR, 1 + JITTER_FACTOR]`, still capped at the maximum.
    pub fn delay_for_attempt(&self, retry: u32) -> Option<Duration> {
        let delay = self.base_delay(retry)?;
        match self {
            Self::Exponential {
                jitter: true,
                max_delay,
                ..
            } => {
                let factor = rand::thread_rng()
                    .gen_range(1.0 - JITTER_FACTOR..=1.0 + JITTER_FACTOR);
                let jittered = Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
                    .unwrap_or(*max_delay);
                Some(jittered.min(*max_delay))
            }
            _ => Some(delay),
        }
    }

    /// Returns the maximum number of retries allowed.
    pub fn max_retries(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Exponential { max_retries, .. } => *max_retries,
        }
    }

    /// Total invocations including the first attempt.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries().saturating_add(1)
    }
}
