//! Delay between stage attempts after an executor error.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::OrchestratorConfig;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// delay = base * attempt
    Linear,
    /// delay = base
    Constant,
}

/// Jitter applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter.
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// Half fixed, half uniform.
    #[default]
    Equal,
}

/// Retry delay policy for executor errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBackoff {
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Cap in milliseconds.
    pub max_delay_ms: u64,
    /// Growth strategy.
    pub strategy: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            strategy: BackoffStrategy::Exponential,
            jitter: JitterStrategy::Equal,
        }
    }
}

impl RetryBackoff {
    /// Builds the policy from configuration.
    #[must_use]
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            base_delay_ms: config.retry_base_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
            ..Self::default()
        }
    }

    /// A policy that never waits.
    #[must_use]
    pub const fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: 0,
            strategy: BackoffStrategy::Constant,
            jitter: JitterStrategy::None,
        }
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the growth strategy.
    #[must_use]
    pub const fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Delay before retrying after the failed 1-based `attempt`.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms;
        let max = self.max_delay_ms;
        let step = attempt.saturating_sub(1);

        let delay = match self.strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(step)),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt.max(1))),
            BackoffStrategy::Constant => base,
        }
        .min(max);

        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full if delay == 0 => 0,
            JitterStrategy::Full => rand::thread_rng().gen_range(0..=delay),
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };
        Duration::from_millis(jittered)
    }
}
