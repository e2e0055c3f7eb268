//! Network samples and the connection quality classifier

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single network measurement pushed by the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSample {
    /// Round-trip time in milliseconds
    pub rtt_ms: f64,
    /// Packet loss in percent (0-100)
    pub packet_loss_pct: f64,
    /// Jitter in milliseconds
    pub jitter_ms: f64,
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
}

impl NetworkSample {
    /// Create a sample stamped with an explicit time
    pub fn new(rtt_ms: f64, packet_loss_pct: f64, jitter_ms: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            rtt_ms,
            packet_loss_pct,
            jitter_ms,
            timestamp,
        }
    }

    /// Create a sample stamped with the current wall-clock time
    pub fn now(rtt_ms: f64, packet_loss_pct: f64, jitter_ms: f64) -> Self {
        Self::new(rtt_ms, packet_loss_pct, jitter_ms, Utc::now())
    }

    /// Classify this sample
    pub fn quality(&self) -> ConnectionQuality {
        ConnectionQuality::classify(self.rtt_ms, self.packet_loss_pct)
    }
}

/// Connection quality levels shown to users
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    /// Unusable for interactive control
    Poor,
    /// Noticeable lag
    Fair,
    /// Comfortable
    Good,
    /// Near-local
    Excellent,
}

impl ConnectionQuality {
    /// Classify a latency / loss pair
    ///
    /// - excellent: rtt < 50ms and loss < 1%
    /// - good: rtt < 100ms and loss < 3%
    /// - fair: rtt < 200ms and loss < 5%
    /// - poor: anything else
    pub fn classify(rtt_ms: f64, packet_loss_pct: f64) -> Self {
        if rtt_ms < 50.0 && packet_loss_pct < 1.0 {
            ConnectionQuality::Excellent
        } else if rtt_ms < 100.0 && packet_loss_pct < 3.0 {
            ConnectionQuality::Good
        } else if rtt_ms < 200.0 && packet_loss_pct < 5.0 {
            ConnectionQuality::Fair
        } else {
            ConnectionQuality::Poor
        }
    }

    /// Stable label for logs and UI
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionQuality::Excellent => "excellent",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Fair => "fair",
            ConnectionQuality::Poor => "poor",
        }
    }
}

impl std::fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_thresholds() {
        assert_eq!(ConnectionQuality::classify(49.9, 0.9), ConnectionQuality::Excellent);
        assert_eq!(ConnectionQuality::classify(50.0, 0.0), ConnectionQuality::Good);
        assert_eq!(ConnectionQuality::classify(10.0, 1.0), ConnectionQuality::Good);
        assert_eq!(ConnectionQuality::classify(99.0, 2.9), ConnectionQuality::Good);
        assert_eq!(ConnectionQuality::classify(100.0, 0.0), ConnectionQuality::Fair);
        assert_eq!(ConnectionQuality::classify(199.0, 4.9), ConnectionQuality::Fair);
        assert_eq!(ConnectionQuality::classify(200.0, 0.0), ConnectionQuality::Poor);
        assert_eq!(ConnectionQuality::classify(20.0, 5.0), ConnectionQuality::Poor);
    }

    #[test]
    fn test_quality_ordering() {
        assert!(ConnectionQuality::Excellent > ConnectionQuality::Good);
        assert!(ConnectionQuality::Fair > ConnectionQuality::Poor);
    }

    #[test]
    fn test_sample_serialization() {
        let sample = NetworkSample::now(42.0, 0.5, 4.0);
        let json = serde_json::to_string(&sample).unwrap();
        assert!(json.contains("\"rttMs\":42.0"));
        assert!(json.contains("\"packetLossPct\":0.5"));

        let decoded: NetworkSample = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, sample);
    }
}
