//! Reconnect backoff bookkeeping
//!
//! The policy is pure arithmetic; `McpClient` owns the state and schedules
//! the attempts.

use std::time::Duration;

use super::server_config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// `min(base * 2^attempt, max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl From<&RetryConfig> for ReconnectPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Outcome of asking for the next reconnect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again after `delay`; `attempt` is 1-based
    Retry { attempt: u32, delay: Duration },
    /// Attempts used up
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectState {
    attempt_count: u32,
}

impl ReconnectState {
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Consume one attempt if the policy allows it
    pub fn next(&mut self, policy: &ReconnectPolicy) -> ReconnectDecision {
        if self.attempt_count >= policy.max_attempts {
            return ReconnectDecision::Exhausted {
                attempts: self.attempt_count,
            };
        }

        let delay = policy.delay_for(self.attempt_count);
        self.attempt_count += 1;
        ReconnectDecision::Retry {
            attempt: self.attempt_count,
            delay,
        }
    }

    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }
}
