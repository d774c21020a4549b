//! Retry policy with exponential backoff

use std::time::Duration;

/// Retry policy for binding sockets and reconnecting to upstream nodes
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    /// Maximum attempts (0 = unlimited)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Delay multiplier per attempt
    pub backoff_multiplier: f32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RecoveryPolicy {
    /// Policy used when a listening port is still in use: 0.3 s doubling, 5 tries
    pub fn bind() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }

    /// Calculate delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        #[allow(clippy::cast_possible_wrap)]
        let multiplier = self.backoff_multiplier.powi(attempt.min(64) as i32);
        let delay_secs = self.initial_delay.as_secs_f32() * multiplier;
        let capped = delay_secs.min(self.max_delay.as_secs_f32());

        Duration::from_secs_f32(capped)
    }

    /// Check if another attempt is allowed
    pub fn should_attempt(&self, current_attempt: u32) -> bool {
        self.max_attempts == 0 || current_attempt < self.max_attempts
    }
}
