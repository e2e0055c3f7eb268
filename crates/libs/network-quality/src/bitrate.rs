//! Adaptive bitrate recommendation
//!
//! Decreases multiplicatively as soon as average latency crosses a threshold
//! and increases in small steps only when latency is low and the link has
//! spare bandwidth. The asymmetry keeps the recommendation from oscillating.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Thresholds and factors driving the bitrate controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitratePolicy {
    /// Lower bound of the recommendation in kbps
    #[serde(default = "default_min_bitrate_kbps")]
    pub min_bitrate_kbps: u32,

    /// Upper bound of the recommendation in kbps
    #[serde(default = "default_max_bitrate_kbps")]
    pub max_bitrate_kbps: u32,

    /// Starting recommendation in kbps
    #[serde(default = "default_initial_bitrate_kbps")]
    pub initial_bitrate_kbps: u32,

    /// Average latency above which the steep decrease applies
    #[serde(default = "default_high_latency_ms")]
    pub high_latency_ms: f64,

    /// Multiplier applied above `high_latency_ms`
    #[serde(default = "default_high_latency_factor")]
    pub high_latency_factor: f64,

    /// Average latency above which the mild decrease applies
    #[serde(default = "default_elevated_latency_ms")]
    pub elevated_latency_ms: f64,

    /// Multiplier applied above `elevated_latency_ms`
    #[serde(default = "default_elevated_latency_factor")]
    pub elevated_latency_factor: f64,

    /// Average latency below which increases are allowed
    #[serde(default = "default_low_latency_ms")]
    pub low_latency_ms: f64,

    /// Multiplier applied when increasing
    #[serde(default = "default_increase_factor")]
    pub increase_factor: f64,
}

fn default_min_bitrate_kbps() -> u32 {
    300
}

fn default_max_bitrate_kbps() -> u32 {
    8000
}

fn default_initial_bitrate_kbps() -> u32 {
    2000
}

fn default_high_latency_ms() -> f64 {
    150.0
}

fn default_high_latency_factor() -> f64 {
    0.8
}

fn default_elevated_latency_ms() -> f64 {
    100.0
}

fn default_elevated_latency_factor() -> f64 {
    0.9
}

fn default_low_latency_ms() -> f64 {
    50.0
}

fn default_increase_factor() -> f64 {
    1.1
}

impl Default for BitratePolicy {
    fn default() -> Self {
        Self {
            min_bitrate_kbps: default_min_bitrate_kbps(),
            max_bitrate_kbps: default_max_bitrate_kbps(),
            initial_bitrate_kbps: default_initial_bitrate_kbps(),
            high_latency_ms: default_high_latency_ms(),
            high_latency_factor: default_high_latency_factor(),
            elevated_latency_ms: default_elevated_latency_ms(),
            elevated_latency_factor: default_elevated_latency_factor(),
            low_latency_ms: default_low_latency_ms(),
            increase_factor: default_increase_factor(),
        }
    }
}

impl BitratePolicy {
    /// Validate bounds and factors
    pub fn validate(&self) -> crate::Result<()> {
        use crate::QualityError;

        if self.min_bitrate_kbps == 0 || self.min_bitrate_kbps > self.max_bitrate_kbps {
            return Err(QualityError::InvalidConfig(format!(
                "bitrate bounds must satisfy 0 < min <= max, got [{}, {}]",
                self.min_bitrate_kbps, self.max_bitrate_kbps
            )));
        }

        if self.initial_bitrate_kbps < self.min_bitrate_kbps
            || self.initial_bitrate_kbps > self.max_bitrate_kbps
        {
            return Err(QualityError::InvalidConfig(format!(
                "initial_bitrate_kbps {} outside [{}, {}]",
                self.initial_bitrate_kbps, self.min_bitrate_kbps, self.max_bitrate_kbps
            )));
        }

        for (name, factor) in [
            ("high_latency_factor", self.high_latency_factor),
            ("elevated_latency_factor", self.elevated_latency_factor),
        ] {
            if !(factor > 0.0 && factor < 1.0) {
                return Err(QualityError::InvalidConfig(format!(
                    "{} must be in (0, 1), got {}",
                    name, factor
                )));
            }
        }

        if self.increase_factor <= 1.0 {
            return Err(QualityError::InvalidConfig(format!(
                "increase_factor must be > 1, got {}",
                self.increase_factor
            )));
        }

        if !(self.low_latency_ms < self.elevated_latency_ms
            && self.elevated_latency_ms < self.high_latency_ms)
        {
            return Err(QualityError::InvalidConfig(
                "latency thresholds must satisfy low < elevated < high".to_string(),
            ));
        }

        Ok(())
    }
}

/// Adaptive bitrate controller
#[derive(Debug, Clone)]
pub struct BitrateController {
    policy: BitratePolicy,
    current_kbps: u32,
}

impl BitrateController {
    /// Create a controller starting at the policy's initial bitrate
    pub fn new(policy: BitratePolicy) -> Self {
        let current_kbps = policy.initial_bitrate_kbps;
        Self {
            policy,
            current_kbps,
        }
    }

    /// Current recommendation in kbps
    pub fn current_kbps(&self) -> u32 {
        self.current_kbps
    }

    /// The policy driving this controller
    pub fn policy(&self) -> &BitratePolicy {
        &self.policy
    }

    /// Recompute the recommendation from the rolling average latency
    ///
    /// `available_bandwidth_kbps` is the transport's estimate, if any. Without
    /// an estimate the controller never increases.
    pub fn update(&mut self, average_rtt_ms: f64, available_bandwidth_kbps: Option<u32>) -> u32 {
        let p = &self.policy;
        let current = self.current_kbps as f64;

        let next = if average_rtt_ms > p.high_latency_ms {
            current * p.high_latency_factor
        } else if average_rtt_ms > p.elevated_latency_ms {
            current * p.elevated_latency_factor
        } else if average_rtt_ms < p.low_latency_ms {
            match available_bandwidth_kbps {
                Some(available) if available > self.current_kbps => {
                    (current * p.increase_factor).min(available as f64)
                }
                _ => current,
            }
        } else {
            current
        };

        let next = (next.round() as u32).clamp(p.min_bitrate_kbps, p.max_bitrate_kbps);
        if next != self.current_kbps {
            debug!(
                "Bitrate recommendation {} -> {} kbps (avg rtt {:.1}ms)",
                self.current_kbps, next, average_rtt_ms
            );
        }
        self.current_kbps = next;
        next
    }
}
