//! Remote-control session aggregate

use crate::error::ResourceError;
use chrono::{DateTime, Utc};
use remotedesk_network_quality::ConnectionQuality;
use serde::{Deserialize, Serialize};

/// Session identifier
pub type SessionId = String;

/// Session lifecycle state
///
/// `Pending -> Active <-> Paused -> Ended`, and `Pending -> Ended` when the
/// connection never comes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Active,
    Paused,
    Ended,
}

impl SessionStatus {
    /// Active or Paused
    pub fn is_live(self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Paused)
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "resource", rename_all = "snake_case")]
pub enum EndReason {
    /// Local user ended it
    UserEnded,
    /// Peer ended it
    RemoteEnded,
    /// Peer or its credential check declined before the session went active
    Rejected,
    /// Connection did not come up in time
    Timeout,
    /// Established connection was lost
    ConnectionLost,
    /// A platform collaborator failed
    ResourceFailure(ResourceError),
}

/// Which side of the session this device is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Controller,
    Controlled,
}

/// What the controller may do in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPermissions {
    #[serde(default = "default_true")]
    pub allow_input: bool,
    #[serde(default = "default_true")]
    pub allow_clipboard: bool,
    #[serde(default = "default_true")]
    pub allow_file_transfer: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SessionPermissions {
    fn default() -> Self {
        Self {
            allow_input: true,
            allow_clipboard: true,
            allow_file_transfer: true,
        }
    }
}

impl SessionPermissions {
    /// View-only session
    pub fn view_only() -> Self {
        Self {
            allow_input: false,
            allow_clipboard: false,
            allow_file_transfer: false,
        }
    }
}

/// Options for [`SessionManager::create_session`](super::SessionManager::create_session)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub role: SessionRole,
    pub permissions: SessionPermissions,
    /// Use this id instead of allocating one (the controlled side reuses the
    /// controller's signaling session id)
    pub session_id: Option<SessionId>,
}

impl SessionOptions {
    pub fn controller() -> Self {
        Self {
            role: SessionRole::Controller,
            permissions: SessionPermissions::default(),
            session_id: None,
        }
    }

    pub fn controlled(session_id: impl Into<SessionId>, permissions: SessionPermissions) -> Self {
        Self {
            role: SessionRole::Controlled,
            permissions,
            session_id: Some(session_id.into()),
        }
    }

    pub fn with_permissions(mut self, permissions: SessionPermissions) -> Self {
        self.permissions = permissions;
        self
    }
}

/// One transport measurement plus traffic counters since the last one
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsUpdate {
    pub latency_ms: f64,
    pub packet_loss_pct: f64,
    pub jitter_ms: f64,
    #[serde(default)]
    pub bytes_sent_delta: u64,
    #[serde(default)]
    pub bytes_received_delta: u64,
}

/// Live statistics of a session
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    /// Exponentially smoothed latency
    pub avg_latency_ms: f64,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub last_packet_loss_pct: f64,
    pub last_jitter_ms: f64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub sample_count: u64,
    /// Injections that exceeded the input latency budget
    pub slow_input_events: u64,
    pub connection_quality: Option<ConnectionQuality>,
}

impl SessionStats {
    /// Fold one update in; `old_weight` is the smoothing weight of the
    /// running average
    pub fn apply(&mut self, update: &StatsUpdate, old_weight: f64) {
        let latency = update.latency_ms.max(0.0);
        self.avg_latency_ms = if self.sample_count == 0 {
            latency
        } else {
            self.avg_latency_ms * old_weight + latency * (1.0 - old_weight)
        };
        self.min_latency_ms = Some(self.min_latency_ms.map_or(latency, |m| m.min(latency)));
        self.max_latency_ms = Some(self.max_latency_ms.map_or(latency, |m| m.max(latency)));
        self.last_packet_loss_pct = update.packet_loss_pct;
        self.last_jitter_ms = update.jitter_ms;
        self.bytes_sent = self.bytes_sent.saturating_add(update.bytes_sent_delta);
        self.bytes_received = self.bytes_received.saturating_add(update.bytes_received_delta);
        self.sample_count += 1;
        self.connection_quality = Some(ConnectionQuality::classify(
            self.avg_latency_ms,
            self.last_packet_loss_pct,
        ));
    }
}

/// A remote-control session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: SessionId,
    pub controller_id: String,
    pub controlled_id: String,
    pub role: SessionRole,
    pub start_time: DateTime<Utc>,
    /// Set iff `status` is `Ended`
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub end_reason: Option<EndReason>,
    pub stats: SessionStats,
    pub permissions: SessionPermissions,
    /// Underlying peer connection while live
    pub connection_id: Option<String>,
    pub is_relay: bool,
}

impl Session {
    /// Device on the other end
    pub fn remote_device_id(&self) -> &str {
        match self.role {
            SessionRole::Controller => &self.controlled_id,
            SessionRole::Controlled => &self.controller_id,
        }
    }
}

/// Immutable snapshot of an ended session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub controller_id: String,
    pub controlled_id: String,
    pub role: SessionRole,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_secs: i64,
    pub end_reason: EndReason,
    pub stats: SessionStats,
    pub permissions: SessionPermissions,
    pub was_relay: bool,
}

impl SessionRecord {
    /// Snapshot `session`, which must already be ended
    pub(crate) fn from_ended(session: &Session, end_time: DateTime<Utc>, reason: EndReason) -> Self {
        Self {
            session_id: session.session_id.clone(),
            controller_id: session.controller_id.clone(),
            controlled_id: session.controlled_id.clone(),
            role: session.role,
            start_time: session.start_time,
            end_time,
            duration_secs: (end_time - session.start_time).num_seconds().max(0),
            end_reason: reason,
            stats: session.stats.clone(),
            permissions: session.permissions,
            was_relay: session.is_relay,
        }
    }
}

/// What happened to a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEventKind {
    Created,
    Activated { connection_id: String, is_relay: bool },
    Paused,
    Resumed,
    Reassociated { connection_id: String, is_relay: bool },
    SlowInput { elapsed_ms: u64 },
    Ended { reason: EndReason, duration_secs: i64 },
    /// The history store refused the record of an ended session
    RecordNotSaved { record: Box<SessionRecord>, error: String },
}

/// Published on every session lifecycle change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub kind: SessionEventKind,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(latency_ms: f64, loss: f64) -> StatsUpdate {
        StatsUpdate {
            latency_ms,
            packet_loss_pct: loss,
            jitter_ms: 2.0,
            bytes_sent_delta: 100,
            bytes_received_delta: 50,
        }
    }

    #[test]
    fn test_first_sample_seeds_average() {
        let mut stats = SessionStats::default();
        stats.apply(&update(80.0, 0.5), 0.9);
        assert_eq!(stats.avg_latency_ms, 80.0);
        assert_eq!(stats.connection_quality, Some(ConnectionQuality::Good));
    }

    #[test]
    fn test_smoothing_and_extremes() {
        let mut stats = SessionStats::default();
        stats.apply(&update(100.0, 0.0), 0.9);
        stats.apply(&update(200.0, 0.0), 0.9);

        assert!((stats.avg_latency_ms - 110.0).abs() < 1e-9);
        assert_eq!(stats.min_latency_ms, Some(100.0));
        assert_eq!(stats.max_latency_ms, Some(200.0));
        assert_eq!(stats.bytes_sent, 200);
        assert_eq!(stats.bytes_received, 100);
        assert_eq!(stats.sample_count, 2);
        assert_eq!(stats.connection_quality, Some(ConnectionQuality::Fair));
    }

    #[test]
    fn test_loss_drives_quality() {
        let mut stats = SessionStats::default();
        stats.apply(&update(20.0, 6.0), 0.9);
        assert_eq!(stats.connection_quality, Some(ConnectionQuality::Poor));
    }

    #[test]
    fn test_end_reason_serialization() {
        let json = serde_json::to_value(EndReason::ResourceFailure(ResourceError::OutOfMemory)).unwrap();
        assert_eq!(json["kind"], "resource_failure");

        let json = serde_json::to_value(EndReason::UserEnded).unwrap();
        assert_eq!(json["kind"], "user_ended");
    }
}
