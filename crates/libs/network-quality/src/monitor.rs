//! Rolling network quality monitor

use crate::bitrate::{BitrateController, BitratePolicy};
use crate::{ConnectionQuality, NetworkSample, QualityError, QualityEvent};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Number of samples kept in the ring buffer (default: 60, ~1 minute at 1Hz)
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Adaptive bitrate policy
    #[serde(default)]
    pub bitrate: BitratePolicy,
}

fn default_window_size() -> usize {
    60
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            bitrate: BitratePolicy::default(),
        }
    }
}

impl QualityConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> crate::Result<()> {
        if self.window_size == 0 || self.window_size > 3600 {
            return Err(QualityError::InvalidConfig(format!(
                "window_size must be in range 1-3600, got {}",
                self.window_size
            )));
        }
        self.bitrate.validate()
    }
}

/// Ring-buffered network quality monitor for one session
///
/// Samples are pushed in; every push recomputes the rolling classification
/// and the bitrate recommendation and returns the resulting events.
#[derive(Debug, Clone)]
pub struct NetworkQualityMonitor {
    window_size: usize,
    samples: VecDeque<NetworkSample>,
    bitrate: BitrateController,
    available_bandwidth_kbps: Option<u32>,
    quality: Option<ConnectionQuality>,
}

impl NetworkQualityMonitor {
    /// Create a monitor from a validated configuration
    pub fn new(config: QualityConfig) -> crate::Result<Self> {
        config.validate()?;
        Ok(Self {
            window_size: config.window_size,
            samples: VecDeque::with_capacity(config.window_size),
            bitrate: BitrateController::new(config.bitrate),
            available_bandwidth_kbps: None,
            quality: None,
        })
    }

    /// Record the transport's latest bandwidth estimate
    pub fn set_available_bandwidth(&mut self, kbps: Option<u32>) {
        self.available_bandwidth_kbps = kbps;
    }

    /// Push a sample and return the events it caused
    pub fn push(&mut self, sample: NetworkSample) -> Vec<QualityEvent> {
        if self.samples.len() == self.window_size {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);

        let mut events = Vec::new();

        let avg_rtt = self.average_rtt_ms().unwrap_or(sample.rtt_ms);
        let avg_loss = self.average_packet_loss_pct().unwrap_or(sample.packet_loss_pct);
        let quality = ConnectionQuality::classify(avg_rtt, avg_loss);

        if self.quality != Some(quality) {
            debug!(
                "Network quality {:?} -> {} (avg rtt {:.1}ms, loss {:.2}%)",
                self.quality, quality, avg_rtt, avg_loss
            );
            events.push(QualityEvent::QualityChanged {
                from: self.quality,
                to: quality,
            });
            if quality == ConnectionQuality::Poor {
                warn!(
                    "Network quality is poor (avg rtt {:.1}ms, loss {:.2}%)",
                    avg_rtt, avg_loss
                );
                events.push(QualityEvent::QualityWarning {
                    average_rtt_ms: avg_rtt,
                    average_packet_loss_pct: avg_loss,
                });
            }
            self.quality = Some(quality);
        }

        let before = self.bitrate.current_kbps();
        let after = self.bitrate.update(avg_rtt, self.available_bandwidth_kbps);
        if before != after {
            events.push(QualityEvent::BitrateChanged {
                from_kbps: before,
                to_kbps: after,
            });
        }

        events
    }

    /// Number of samples currently buffered
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Most recent sample
    pub fn latest(&self) -> Option<&NetworkSample> {
        self.samples.back()
    }

    /// Rolling classification, `None` before the first sample
    pub fn current_quality(&self) -> Option<ConnectionQuality> {
        self.quality
    }

    /// Current bitrate recommendation in kbps
    pub fn recommended_bitrate_kbps(&self) -> u32 {
        self.bitrate.current_kbps()
    }

    /// Rolling average round-trip time
    pub fn average_rtt_ms(&self) -> Option<f64> {
        self.mean(|s| s.rtt_ms)
    }

    /// Rolling average packet loss
    pub fn average_packet_loss_pct(&self) -> Option<f64> {
        self.mean(|s| s.packet_loss_pct)
    }

    /// Rolling average jitter
    pub fn average_jitter_ms(&self) -> Option<f64> {
        self.mean(|s| s.jitter_ms)
    }

    /// 95th percentile round-trip time (nearest-rank)
    pub fn p95_rtt_ms(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut rtts: Vec<f64> = self.samples.iter().map(|s| s.rtt_ms).collect();
        rtts.sort_by(|a, b| a.total_cmp(b));
        let rank = ((0.95 * rtts.len() as f64).ceil() as usize).max(1);
        Some(rtts[rank - 1])
    }

    fn mean(&self, field: impl Fn(&NetworkSample) -> f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: f64 = self.samples.iter().map(field).sum();
        Some(sum / self.samples.len() as f64)
    }
}
