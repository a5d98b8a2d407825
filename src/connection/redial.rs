use std::time::Duration;

use rand::Rng;

use crate::{config::BrokerConfig, server::CloseReason};

/// Linear backoff between redial attempts, capped, plus random jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: Duration) -> Self {
        Self { base, max, jitter }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(
            config.redial_base_delay(),
            config.redial_max_delay(),
            config.redial_jitter(),
        )
    }

    /// Delay before the given attempt, counting from 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.saturating_mul(attempt).min(self.max);
        let jitter = self.jitter.as_millis() as u64;

        if jitter == 0 {
            delay
        } else {
            delay + Duration::from_millis(rand::rng().random_range(0..=jitter))
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}

/// What the redial loop reports to its subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedialEvent {
    Disconnected(CloseReason),
    Reconnected { attempts: u32 },
}
