//! Session manager
//!
//! Sole owner of every live [`Session`]. Each session carries its own
//! [`NetworkQualityMonitor`]; ended sessions are snapshotted into the
//! [`HistoryStore`] and pruned past the retention window.

use super::history::HistoryStore;
use super::session::{
    EndReason, Session, SessionEvent, SessionEventKind, SessionId, SessionOptions, SessionRecord,
    SessionRole, SessionStats, SessionStatus, StatsUpdate,
};
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::error::ResourceError;
use crate::events::{EngineEvent, EventBus};
use crate::peer::{FailureReason, PeerConnection};
use crate::platform::{CapturedFrame, InputEvent, InputInjector, Notifier, ScreenCapture, SilentNotifier};
use crate::{Error, Result};
use async_trait::async_trait;
use remotedesk_network_quality::{
    ConnectionQuality, NetworkQualityMonitor, NetworkSample, QualityConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Transport statistics feed for the periodic sampler
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn sample(&self, session_id: &str) -> Result<StatsUpdate>;
}

/// Rolling network view of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualitySummary {
    pub quality: Option<ConnectionQuality>,
    pub average_rtt_ms: Option<f64>,
    pub p95_rtt_ms: Option<f64>,
    pub average_packet_loss_pct: Option<f64>,
    pub average_jitter_ms: Option<f64>,
    pub recommended_bitrate_kbps: u32,
}

struct SessionEntry {
    session: Session,
    monitor: NetworkQualityMonitor,
}

/// Owns the lifecycle of remote-control sessions
pub struct SessionManager {
    local_device_id: String,
    config: SessionConfig,
    quality: QualityConfig,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    history: Arc<dyn HistoryStore>,
    notifier: Arc<dyn Notifier>,
    input: Option<Arc<dyn InputInjector>>,
    capture: Option<Arc<dyn ScreenCapture>>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("local_device_id", &self.local_device_id)
            .field("config", &self.config)
            .finish()
    }
}

impl SessionManager {
    /// Create a manager for `local_device_id`
    pub fn new(
        local_device_id: impl Into<String>,
        config: SessionConfig,
        quality: QualityConfig,
        history: Arc<dyn HistoryStore>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        quality
            .validate()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let local_device_id = local_device_id.into();
        info!(
            "Creating session manager for {} (max_sessions: {})",
            local_device_id, config.max_sessions
        );

        Ok(Self {
            local_device_id,
            config,
            quality,
            sessions: RwLock::new(HashMap::new()),
            history,
            notifier: Arc::new(SilentNotifier),
            input: None,
            capture: None,
            events,
            clock,
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_input_injector(mut self, input: Arc<dyn InputInjector>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_screen_capture(mut self, capture: Arc<dyn ScreenCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Allocate a `Pending` session with `remote_device_id`
    pub async fn create_session(
        &self,
        remote_device_id: &str,
        options: SessionOptions,
    ) -> Result<Session> {
        let session_id = options
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let monitor = NetworkQualityMonitor::new(self.quality.clone())
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let (controller_id, controlled_id) = match options.role {
            SessionRole::Controller => (self.local_device_id.clone(), remote_device_id.to_string()),
            SessionRole::Controlled => (remote_device_id.to_string(), self.local_device_id.clone()),
        };
        let session = Session {
            session_id: session_id.clone(),
            controller_id,
            controlled_id,
            role: options.role,
            start_time: self.clock.now(),
            end_time: None,
            status: SessionStatus::Pending,
            end_reason: None,
            stats: SessionStats::default(),
            permissions: options.permissions,
            connection_id: None,
            is_relay: false,
        };

        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&session_id) {
                return Err(Error::SessionError(format!(
                    "Session {} already exists",
                    session_id
                )));
            }
            if self.config.max_sessions > 0 && sessions.len() >= self.config.max_sessions {
                return Err(Error::SessionError(format!(
                    "Maximum number of sessions reached ({})",
                    self.config.max_sessions
                )));
            }
            sessions.insert(
                session_id.clone(),
                SessionEntry {
                    session: session.clone(),
                    monitor,
                },
            );
        }

        info!(
            "Created {:?} session {} with {}",
            options.role, session_id, remote_device_id
        );
        self.publish(&session_id, SessionEventKind::Created);
        Ok(session)
    }

    /// Promote a `Pending` session to `Active` on a connected peer connection
    pub async fn join_session(&self, session_id: &str, connection: &PeerConnection) -> Result<Session> {
        ensure_connected(connection)?;
        let session = {
            let mut sessions = self.sessions.write().await;
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
            let session = &mut entry.session;
            if session.status != SessionStatus::Pending {
                return Err(Error::InvalidState(format!(
                    "cannot join session {} in state {:?}",
                    session_id, session.status
                )));
            }
            if connection.remote_device_id != session.remote_device_id() {
                return Err(Error::InvalidState(format!(
                    "connection {} is to {}, session {} is with {}",
                    connection.connection_id,
                    connection.remote_device_id,
                    session_id,
                    session.remote_device_id()
                )));
            }
            session.status = SessionStatus::Active;
            session.connection_id = Some(connection.connection_id.clone());
            session.is_relay = connection.is_relay;
            session.clone()
        };

        info!(
            "Session {} active over {} path",
            session_id,
            if session.is_relay { "relay" } else { "direct" }
        );
        self.notifier.session_started(&session);
        self.publish(
            session_id,
            SessionEventKind::Activated {
                connection_id: connection.connection_id.clone(),
                is_relay: connection.is_relay,
            },
        );
        Ok(session)
    }

    /// Attach a new connected peer connection to a live session
    pub async fn reassociate_connection(
        &self,
        session_id: &str,
        connection: &PeerConnection,
    ) -> Result<Session> {
        ensure_connected(connection)?;
        let session = {
            let mut sessions = self.sessions.write().await;
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
            if !entry.session.status.is_live() {
                return Err(Error::InvalidState(format!(
                    "cannot reassociate session {} in state {:?}",
                    session_id, entry.session.status
                )));
            }
            entry.session.connection_id = Some(connection.connection_id.clone());
            entry.session.is_relay = connection.is_relay;
            entry.session.clone()
        };

        info!(
            "Session {} moved to connection {}",
            session_id, connection.connection_id
        );
        self.publish(
            session_id,
            SessionEventKind::Reassociated {
                connection_id: connection.connection_id.clone(),
                is_relay: connection.is_relay,
            },
        );
        Ok(session)
    }

    /// `Active -> Paused`; pausing a paused session is a no-op
    pub async fn pause_session(&self, session_id: &str) -> Result<()> {
        if self.set_live_status(session_id, SessionStatus::Paused).await? {
            debug!("Session {} paused", session_id);
            self.publish(session_id, SessionEventKind::Paused);
        }
        Ok(())
    }

    /// `Paused -> Active`; resuming an active session is a no-op
    pub async fn resume_session(&self, session_id: &str) -> Result<()> {
        if self.set_live_status(session_id, SessionStatus::Active).await? {
            debug!("Session {} resumed", session_id);
            self.publish(session_id, SessionEventKind::Resumed);
        }
        Ok(())
    }

    async fn set_live_status(&self, session_id: &str, to: SessionStatus) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        let status = &mut entry.session.status;
        if *status == to {
            return Ok(false);
        }
        if !status.is_live() {
            return Err(Error::InvalidState(format!(
                "session {} is {:?}",
                session_id, status
            )));
        }
        *status = to;
        Ok(true)
    }

    /// End a session and record it in history
    ///
    /// Removes the session from the live set, appends its record and prunes
    /// records past the retention window.
    pub async fn end_session(&self, session_id: &str, reason: EndReason) -> Result<SessionRecord> {
        let entry = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        let mut session = entry.session;
        let now = self.clock.now();
        let end_time = now.max(session.start_time);
        session.status = SessionStatus::Ended;
        session.end_time = Some(end_time);
        session.end_reason = Some(reason);
        session.connection_id = None;

        let record = SessionRecord::from_ended(&session, end_time, reason);
        info!(
            "Session {} ended ({:?}) after {}s",
            session_id, reason, record.duration_secs
        );

        let saved = self.history.append(record.clone()).await;
        if saved.is_ok() {
            match self.history.prune(now - self.config.retention()).await {
                Ok(0) => {}
                Ok(n) => debug!("Pruned {} expired session records", n),
                Err(e) => warn!("History prune failed: {}", e),
            }
        }

        self.notifier.session_ended(&session, &reason);
        self.publish(
            session_id,
            SessionEventKind::Ended {
                reason,
                duration_secs: record.duration_secs,
            },
        );

        match saved {
            Ok(()) => Ok(record),
            Err(e) => {
                error!("Failed to record session {}: {}", session_id, e);
                self.publish(
                    session_id,
                    SessionEventKind::RecordNotSaved {
                        record: Box::new(record),
                        error: e.to_string(),
                    },
                );
                Err(Error::SessionError(format!(
                    "session {} ended but its record was not saved: {}",
                    session_id, e
                )))
            }
        }
    }

    /// The session's peer connection failed
    ///
    /// A `Pending` session ends as `Rejected` or `Timeout`; a live one as
    /// `ConnectionLost`.
    pub async fn on_connection_failed(
        &self,
        session_id: &str,
        failure: FailureReason,
    ) -> Result<SessionRecord> {
        let status = self.status(session_id).await?;
        let reason = match status {
            SessionStatus::Pending if failure.is_rejection() => EndReason::Rejected,
            SessionStatus::Pending => EndReason::Timeout,
            _ => EndReason::ConnectionLost,
        };
        self.end_session(session_id, reason).await
    }

    /// A platform collaborator failed; end the session gracefully
    pub async fn report_resource_error(
        &self,
        session_id: &str,
        resource: ResourceError,
    ) -> Result<SessionRecord> {
        warn!("Resource failure in session {}: {}", session_id, resource);
        self.end_session(session_id, EndReason::ResourceFailure(resource))
            .await
    }

    /// Fold a transport sample into the session's stats and quality monitor
    pub async fn update_session_stats(
        &self,
        session_id: &str,
        update: StatsUpdate,
    ) -> Result<SessionStats> {
        let now = self.clock.now();
        let (stats, quality_events) = {
            let mut sessions = self.sessions.write().await;
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
            entry
                .session
                .stats
                .apply(&update, self.config.smoothing_old_weight);
            let events = entry.monitor.push(NetworkSample::new(
                update.latency_ms,
                update.packet_loss_pct,
                update.jitter_ms,
                now,
            ));
            (entry.session.stats.clone(), events)
        };

        for event in quality_events {
            self.events.publish(EngineEvent::Quality {
                session_id: session_id.to_string(),
                event,
            });
        }
        Ok(stats)
    }

    /// Feed the transport's bandwidth estimate to the bitrate controller
    pub async fn set_available_bandwidth(&self, session_id: &str, kbps: Option<u32>) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        entry.monitor.set_available_bandwidth(kbps);
        Ok(())
    }

    /// Current bitrate recommendation for the media pipeline
    pub async fn bitrate_recommendation(&self, session_id: &str) -> Result<u32> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        Ok(entry.monitor.recommended_bitrate_kbps())
    }

    pub async fn quality_summary(&self, session_id: &str) -> Result<QualitySummary> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        let m = &entry.monitor;
        Ok(QualitySummary {
            quality: m.current_quality(),
            average_rtt_ms: m.average_rtt_ms(),
            p95_rtt_ms: m.p95_rtt_ms(),
            average_packet_loss_pct: m.average_packet_loss_pct(),
            average_jitter_ms: m.average_jitter_ms(),
            recommended_bitrate_kbps: m.recommended_bitrate_kbps(),
        })
    }

    /// How often the session should be sampled in its current state
    pub async fn sample_interval(&self, session_id: &str) -> Result<Duration> {
        let status = self.status(session_id).await?;
        Ok(self.interval_for(status))
    }

    fn interval_for(&self, status: SessionStatus) -> Duration {
        match status {
            SessionStatus::Paused => Duration::from_millis(self.config.paused_sample_interval_ms),
            _ => Duration::from_millis(self.config.active_sample_interval_ms),
        }
    }

    /// Sample `source` for `session_id` until the session ends
    ///
    /// Paused sessions keep being sampled at the reduced rate. Failed samples
    /// are skipped.
    pub fn run_sampler(
        self: &Arc<Self>,
        session_id: &str,
        source: Arc<dyn StatsSource>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            loop {
                let interval = match manager.sample_interval(&session_id).await {
                    Ok(interval) => interval,
                    Err(_) => break,
                };
                tokio::time::sleep(interval).await;

                match manager.status(&session_id).await {
                    Ok(status) if status.is_live() => {}
                    Ok(_) => continue,
                    Err(_) => break,
                }
                match source.sample(&session_id).await {
                    Ok(update) => {
                        if manager.update_session_stats(&session_id, update).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("Stats sample for {} failed: {}", session_id, e),
                }
            }
            debug!("Sampler for session {} stopped", session_id);
        })
    }

    /// Forward controller input to the local injector
    ///
    /// Only `Active` sessions that allow input accept events. Injections over
    /// the latency budget are counted in `slow_input_events`; an injector
    /// failure ends the session.
    pub async fn forward_input(&self, session_id: &str, event: &InputEvent) -> Result<()> {
        let injector = self
            .input
            .clone()
            .ok_or_else(|| Error::InvalidState("no input injector configured".to_string()))?;
        {
            let sessions = self.sessions.read().await;
            let session = &sessions
                .get(session_id)
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?
                .session;
            if session.status != SessionStatus::Active {
                return Err(Error::InvalidState(format!(
                    "input rejected: session {} is {:?}",
                    session_id, session.status
                )));
            }
            if !session.permissions.allow_input {
                return Err(Error::DeviceUnauthorized(format!(
                    "input not permitted in session {}",
                    session_id
                )));
            }
        }

        let started = tokio::time::Instant::now();
        let result = injector.inject(event).await;
        let elapsed = started.elapsed();

        if let Err(resource) = result {
            self.report_resource_error(session_id, resource).await?;
            return Err(Error::Resource(resource));
        }

        if elapsed > self.config.input_latency_budget() {
            warn!(
                "Input injection in session {} took {:?} (budget {:?})",
                session_id,
                elapsed,
                self.config.input_latency_budget()
            );
            if let Some(entry) = self.sessions.write().await.get_mut(session_id) {
                entry.session.stats.slow_input_events += 1;
            }
            self.publish(
                session_id,
                SessionEventKind::SlowInput {
                    elapsed_ms: elapsed.as_millis() as u64,
                },
            );
        }
        Ok(())
    }

    /// Capture a frame for a live session; a capture failure ends the session
    pub async fn capture_frame(&self, session_id: &str) -> Result<CapturedFrame> {
        let capture = self
            .capture
            .clone()
            .ok_or_else(|| Error::InvalidState("no screen capture configured".to_string()))?;
        let status = self.status(session_id).await?;
        if status != SessionStatus::Active {
            return Err(Error::InvalidState(format!(
                "capture rejected: session {} is {:?}",
                session_id, status
            )));
        }

        match capture.capture().await {
            Ok(frame) => Ok(frame),
            Err(resource) => {
                self.report_resource_error(session_id, resource).await?;
                Err(Error::Resource(resource))
            }
        }
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|e| e.session.clone())
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Sessions currently `Active` or `Paused`
    pub async fn active_sessions(&self) -> Vec<Session> {
        let mut live: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|e| e.session.status.is_live())
            .map(|e| e.session.clone())
            .collect();
        live.sort_by_key(|s| s.start_time);
        live
    }

    /// Sessions not yet ended, `Pending` included
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Retained history, oldest first
    pub async fn history(&self) -> Result<Vec<SessionRecord>> {
        self.history.list().await
    }

    async fn status(&self, session_id: &str) -> Result<SessionStatus> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|e| e.session.status)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    fn publish(&self, session_id: &str, kind: SessionEventKind) {
        self.events.publish(EngineEvent::Session(SessionEvent {
            session_id: session_id.to_string(),
            kind,
            timestamp: self.clock.now(),
        }));
    }
}

fn ensure_connected(connection: &PeerConnection) -> Result<()> {
    if !connection.state.is_connected() {
        return Err(Error::InvalidState(format!(
            "connection {} is {:?}, not connected",
            connection.connection_id, connection.state
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::peer::{Candidate, CandidateKind, CandidatePair, ConnectionState, PathKind};
    use crate::session::history::MemoryHistory;
    use crate::session::session::SessionPermissions;
    use chrono::Utc;
    use parking_lot::Mutex;

    struct Fixture {
        manager: Arc<SessionManager>,
        clock: Arc<ManualClock>,
        history: Arc<MemoryHistory>,
    }

    fn fixture_with(config: SessionConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let history = Arc::new(MemoryHistory::new());
        let manager = SessionManager::new(
            "local",
            config,
            QualityConfig::default(),
            history.clone(),
            EventBus::default(),
            clock.clone(),
        )
        .unwrap();
        Fixture {
            manager: Arc::new(manager),
            clock,
            history,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SessionConfig::default())
    }

    fn connected(remote: &str) -> PeerConnection {
        let pair = CandidatePair::new(
            Candidate::new(CandidateKind::Host, "10.0.0.2:5000".parse().unwrap()),
            Candidate::new(CandidateKind::Host, "10.0.0.3:5000".parse().unwrap()),
        );
        PeerConnection {
            connection_id: Uuid::new_v4().to_string(),
            session_id: "sig".into(),
            local_device_id: "local".into(),
            remote_device_id: remote.into(),
            state: ConnectionState::Connected {
                path: PathKind::Direct,
            },
            selected_candidate: pair,
            is_relay: false,
            rtt_ms: Some(12.0),
            require_lock_password_check: false,
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_lifecycle_and_active_listing() {
        let f = fixture();
        let s = f
            .manager
            .create_session("remote", SessionOptions::controller())
            .await
            .unwrap();
        assert_eq!(s.status, SessionStatus::Pending);
        assert!(f.manager.active_sessions().await.is_empty());

        f.manager.join_session(&s.session_id, &connected("remote")).await.unwrap();
        assert_eq!(f.manager.active_sessions().await.len(), 1);

        f.manager.pause_session(&s.session_id).await.unwrap();
        f.manager.pause_session(&s.session_id).await.unwrap();
        assert_eq!(f.manager.active_sessions().await[0].status, SessionStatus::Paused);

        f.manager.resume_session(&s.session_id).await.unwrap();
        f.clock.advance(chrono::Duration::seconds(90));

        let record = f
            .manager
            .end_session(&s.session_id, EndReason::UserEnded)
            .await
            .unwrap();
        assert_eq!(record.duration_secs, 90);
        assert!(record.end_time >= record.start_time);
        assert!(f.manager.active_sessions().await.is_empty());
        assert_eq!(f.history.list().await.unwrap().len(), 1);

        assert!(matches!(
            f.manager.end_session(&s.session_id, EndReason::UserEnded).await,
            Err(Error::SessionNotFound(_))
        ));
    }

    /// History that refuses every write
    struct ReadOnlyHistory;

    #[async_trait]
    impl HistoryStore for ReadOnlyHistory {
        async fn append(&self, _record: SessionRecord) -> Result<()> {
            Err(Error::IoError(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "history is read-only",
            )))
        }
        async fn list(&self) -> Result<Vec<SessionRecord>> {
            Ok(Vec::new())
        }
        async fn prune(&self, _cutoff: chrono::DateTime<Utc>) -> Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_unsaved_record_is_surfaced() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let manager = SessionManager::new(
            "local",
            SessionConfig::default(),
            QualityConfig::default(),
            Arc::new(ReadOnlyHistory),
            events,
            Arc::new(ManualClock::new(Utc::now())),
        )
        .unwrap();
        let s = manager
            .create_session("remote", SessionOptions::controller())
            .await
            .unwrap();

        let err = manager
            .end_session(&s.session_id, EndReason::UserEnded)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionError(_)));
        assert!(manager.active_sessions().await.is_empty());

        let mut unsaved = None;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::Session(SessionEvent {
                kind: SessionEventKind::RecordNotSaved { record, .. },
                ..
            }) = event
            {
                unsaved = Some(record);
            }
        }
        let record = unsaved.expect("no RecordNotSaved event");
        assert_eq!(record.session_id, s.session_id);
        assert_eq!(record.end_reason, EndReason::UserEnded);
    }

    #[tokio::test]
    async fn test_join_requires_connected() {
        let f = fixture();
        let s = f
            .manager
            .create_session("remote", SessionOptions::controller())
            .await
            .unwrap();

        let mut conn = connected("remote");
        conn.state = ConnectionState::CandidateGathering;
        assert!(matches!(
            f.manager.join_session(&s.session_id, &conn).await,
            Err(Error::InvalidState(_))
        ));
        assert!(f
            .manager
            .join_session(&s.session_id, &connected("someone-else"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_pending_failure_reasons() {
        let f = fixture();
        let a = f.manager.create_session("r", SessionOptions::controller()).await.unwrap();
        let b = f.manager.create_session("r", SessionOptions::controller()).await.unwrap();

        let rec = f
            .manager
            .on_connection_failed(&a.session_id, FailureReason::CredentialRejected)
            .await
            .unwrap();
        assert_eq!(rec.end_reason, EndReason::Rejected);

        let rec = f
            .manager
            .on_connection_failed(&b.session_id, FailureReason::NatTraversalFailed)
            .await
            .unwrap();
        assert_eq!(rec.end_reason, EndReason::Timeout);
    }

    #[tokio::test]
    async fn test_active_failure_is_connection_lost() {
        let f = fixture();
        let s = f.manager.create_session("r", SessionOptions::controller()).await.unwrap();
        f.manager.join_session(&s.session_id, &connected("r")).await.unwrap();

        let rec = f
            .manager
            .on_connection_failed(&s.session_id, FailureReason::SignalingLost)
            .await
            .unwrap();
        assert_eq!(rec.end_reason, EndReason::ConnectionLost);
    }

    #[tokio::test]
    async fn test_reassociation_keeps_session_id() {
        let f = fixture();
        let s = f.manager.create_session("r", SessionOptions::controller()).await.unwrap();
        f.manager.join_session(&s.session_id, &connected("r")).await.unwrap();

        let mut replacement = connected("r");
        replacement.is_relay = true;
        let moved = f
            .manager
            .reassociate_connection(&s.session_id, &replacement)
            .await
            .unwrap();
        assert_eq!(moved.session_id, s.session_id);
        assert_eq!(moved.connection_id, Some(replacement.connection_id));
        assert!(moved.is_relay);
    }

    #[tokio::test]
    async fn test_history_pruned_on_end() {
        let f = fixture();
        let old = f.manager.create_session("r", SessionOptions::controller()).await.unwrap();
        f.manager.end_session(&old.session_id, EndReason::UserEnded).await.unwrap();

        f.clock.advance(chrono::Duration::days(31));
        let new = f.manager.create_session("r", SessionOptions::controller()).await.unwrap();
        f.manager.end_session(&new.session_id, EndReason::UserEnded).await.unwrap();

        let history = f.manager.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].session_id, new.session_id);
    }

    #[tokio::test]
    async fn test_max_sessions() {
        let f = fixture_with(SessionConfig {
            max_sessions: 1,
            ..Default::default()
        });
        f.manager.create_session("r", SessionOptions::controller()).await.unwrap();
        assert!(f
            .manager
            .create_session("r", SessionOptions::controller())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stats_publish_quality_events() {
        let f = fixture();
        let mut rx = f.manager.events.subscribe();
        let s = f.manager.create_session("r", SessionOptions::controller()).await.unwrap();

        let stats = f
            .manager
            .update_session_stats(
                &s.session_id,
                StatsUpdate {
                    latency_ms: 30.0,
                    packet_loss_pct: 0.1,
                    jitter_ms: 1.0,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(stats.connection_quality, Some(ConnectionQuality::Excellent));

        let mut saw_quality = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EngineEvent::Quality { .. }) {
                saw_quality = true;
            }
        }
        assert!(saw_quality);
        assert!(f.manager.bitrate_recommendation(&s.session_id).await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_sample_interval_by_status() {
        let f = fixture();
        let s = f.manager.create_session("r", SessionOptions::controller()).await.unwrap();
        f.manager.join_session(&s.session_id, &connected("r")).await.unwrap();
        assert_eq!(
            f.manager.sample_interval(&s.session_id).await.unwrap(),
            Duration::from_secs(1)
        );
        f.manager.pause_session(&s.session_id).await.unwrap();
        assert_eq!(
            f.manager.sample_interval(&s.session_id).await.unwrap(),
            Duration::from_secs(5)
        );
    }

    struct ConstantSource;

    #[async_trait]
    impl StatsSource for ConstantSource {
        async fn sample(&self, _session_id: &str) -> Result<StatsUpdate> {
            Ok(StatsUpdate {
                latency_ms: 40.0,
                ..Default::default()
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_keeps_running_while_paused() {
        let f = fixture();
        let s = f.manager.create_session("r", SessionOptions::controller()).await.unwrap();
        f.manager.join_session(&s.session_id, &connected("r")).await.unwrap();
        f.manager.pause_session(&s.session_id).await.unwrap();

        let handle = f.manager.run_sampler(&s.session_id, Arc::new(ConstantSource));
        tokio::time::sleep(Duration::from_millis(10_500)).await;

        let stats = f.manager.get_session(&s.session_id).await.unwrap().stats;
        assert_eq!(stats.sample_count, 2);

        f.manager.end_session(&s.session_id, EndReason::UserEnded).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(handle.is_finished());
    }

    struct SlowInjector {
        delay: Duration,
        seen: Mutex<Vec<InputEvent>>,
    }

    #[async_trait]
    impl InputInjector for SlowInjector {
        async fn inject(&self, event: &InputEvent) -> std::result::Result<(), ResourceError> {
            tokio::time::sleep(self.delay).await;
            self.seen.lock().push(event.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_input_counted() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let injector = Arc::new(SlowInjector {
            delay: Duration::from_millis(150),
            seen: Mutex::new(Vec::new()),
        });
        let manager = SessionManager::new(
            "local",
            SessionConfig::default(),
            QualityConfig::default(),
            Arc::new(MemoryHistory::new()),
            EventBus::default(),
            clock,
        )
        .unwrap()
        .with_input_injector(injector.clone());

        let s = manager.create_session("r", SessionOptions::controlled("sig-1", SessionPermissions::default())).await.unwrap();
        manager.join_session(&s.session_id, &connected("r")).await.unwrap();

        manager
            .forward_input(&s.session_id, &InputEvent::MouseMove { x: 1, y: 2 })
            .await
            .unwrap();
        let stats = manager.get_session(&s.session_id).await.unwrap().stats;
        assert_eq!(stats.slow_input_events, 1);
        assert_eq!(injector.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_input_respects_permissions() {
        let injector = Arc::new(SlowInjector {
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        });
        let manager = SessionManager::new(
            "local",
            SessionConfig::default(),
            QualityConfig::default(),
            Arc::new(MemoryHistory::new()),
            EventBus::default(),
            Arc::new(ManualClock::new(Utc::now())),
        )
        .unwrap()
        .with_input_injector(injector.clone());

        let s = manager
            .create_session("r", SessionOptions::controlled("sig-2", SessionPermissions::view_only()))
            .await
            .unwrap();
        let event = InputEvent::Key { code: 30, pressed: true };

        // not active yet
        assert!(manager.forward_input(&s.session_id, &event).await.is_err());

        manager.join_session(&s.session_id, &connected("r")).await.unwrap();
        assert!(matches!(
            manager.forward_input(&s.session_id, &event).await,
            Err(Error::DeviceUnauthorized(_))
        ));
        assert!(injector.seen.lock().is_empty());
    }

    struct BrokenCapture;

    #[async_trait]
    impl ScreenCapture for BrokenCapture {
        async fn capture(&self) -> std::result::Result<CapturedFrame, ResourceError> {
            Err(ResourceError::PermissionDenied)
        }
    }

    #[tokio::test]
    async fn test_resource_failure_ends_session() {
        let history = Arc::new(MemoryHistory::new());
        let manager = SessionManager::new(
            "local",
            SessionConfig::default(),
            QualityConfig::default(),
            history.clone(),
            EventBus::default(),
            Arc::new(ManualClock::new(Utc::now())),
        )
        .unwrap()
        .with_screen_capture(Arc::new(BrokenCapture));

        let s = manager.create_session("r", SessionOptions::controller()).await.unwrap();
        manager.join_session(&s.session_id, &connected("r")).await.unwrap();

        let err = manager.capture_frame(&s.session_id).await.unwrap_err();
        assert_eq!(err.code().map(|c| c.as_u16()), Some(4002));
        assert!(manager.active_sessions().await.is_empty());
        assert_eq!(
            history.list().await.unwrap()[0].end_reason,
            EndReason::ResourceFailure(ResourceError::PermissionDenied)
        );
    }
}
