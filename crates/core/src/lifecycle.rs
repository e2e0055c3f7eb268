//! Retry backoff shared by connection re-establishment, signaling failover
//! and chunk retries.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff policy
///
/// Controls how retry attempts are spaced and how many are made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Maximum number of retry attempts (default: 5)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds (default: 1000ms)
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    /// Maximum backoff delay in milliseconds (default: 30000ms)
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    /// Backoff multiplier (default: 2.0)
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Whether to add up to 25% random jitter (default: true)
    #[serde(default = "default_jitter")]
    pub jitter_enabled: bool,
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_ms() -> u64 {
    1000
}

fn default_max_ms() -> u64 {
    30000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
            jitter_enabled: default_jitter(),
        }
    }
}

impl BackoffPolicy {
    /// Short, tight policy for per-chunk retries
    pub fn chunk_retry() -> Self {
        Self {
            max_retries: 5,
            initial_ms: 200,
            max_ms: 5000,
            multiplier: 2.0,
            jitter_enabled: true,
        }
    }

    /// Aggressive policy for restoring a dropped data channel
    pub fn aggressive() -> Self {
        Self {
            max_retries: 10,
            initial_ms: 100,
            max_ms: 5000,
            multiplier: 1.5,
            jitter_enabled: true,
        }
    }

    /// Backoff duration before retry `attempt` (0-indexed)
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let backoff_ms = (self.initial_ms as f64) * self.multiplier.powi(attempt as i32);
        let backoff_ms = backoff_ms.min(self.max_ms as f64);

        let final_ms = if self.jitter_enabled && backoff_ms > 0.0 {
            backoff_ms + rand::thread_rng().gen_range(0.0..=backoff_ms * 0.25)
        } else {
            backoff_ms
        };

        Duration::from_millis(final_ms as u64)
    }

    /// Check if more retries are allowed after `attempt` failures
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Validate the policy
    pub fn validate(&self, name: &str) -> crate::Result<()> {
        if self.multiplier < 1.0 {
            return Err(crate::Error::InvalidConfig(format!(
                "{}.multiplier must be >= 1.0, got {}",
                name, self.multiplier
            )));
        }
        if self.initial_ms > self.max_ms {
            return Err(crate::Error::InvalidConfig(format!(
                "{}.initial_ms ({}) must not exceed max_ms ({})",
                name, self.initial_ms, self.max_ms
            )));
        }
        Ok(())
    }
}
