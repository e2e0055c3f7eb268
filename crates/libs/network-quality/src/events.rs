//! Events produced by the quality monitor

use crate::ConnectionQuality;
use serde::{Deserialize, Serialize};

/// Quality event surfaced to the session layer and, from there, to the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QualityEvent {
    /// Rolling classification moved to a different level
    QualityChanged {
        from: Option<ConnectionQuality>,
        to: ConnectionQuality,
    },

    /// Bitrate recommendation changed
    BitrateChanged { from_kbps: u32, to_kbps: u32 },

    /// Quality dropped to `Poor`; UI should warn the user
    QualityWarning {
        average_rtt_ms: f64,
        average_packet_loss_pct: f64,
    },
}

impl QualityEvent {
    /// Check if this is a user-facing warning
    pub fn is_warning(&self) -> bool {
        matches!(self, QualityEvent::QualityWarning { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let event = QualityEvent::BitrateChanged {
            from_kbps: 2000,
            to_kbps: 1600,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"bitrate_changed\""));
        assert!(!event.is_warning());
    }
}
