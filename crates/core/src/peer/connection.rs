//! Per-peer connection state machine
//!
//! ```text
//! Idle -> SignalingConnecting -> Negotiating -> CandidateGathering -> Connected{direct|relay}
//!                                                                        |
//!                                                           Closing -> Closed
//! Failed is reachable from every non-terminal state.
//! ```
//!
//! Each machine owns exactly one [`PeerConnection`]. Every transition is
//! published as a [`ConnectionEvent`] on the engine event bus.

use super::candidate::{Candidate, CandidatePair};
use super::negotiator::{CandidateNegotiator, SelectedPath};
use crate::clock::Clock;
use crate::config::IceConfig;
use crate::events::{EngineEvent, EventBus};
use crate::signaling::{
    ConnectRequestPayload, ConnectResponsePayload, DisconnectPayload, IceCandidatePayload,
    MessageType, SessionDescriptionPayload, SessionSignals, SignalingChannel, SignalingMessage,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// How the selected path carries traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathKind {
    Direct,
    Relay,
}

/// Why a connection ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Signaling handshake did not complete in time
    SignalingTimeout,
    /// Relay connection dropped
    SignalingLost,
    /// Peer declined or is unreachable through the relay
    RemoteRejected,
    /// Credentials were refused
    CredentialRejected,
    /// No candidate pair worked
    NatTraversalFailed,
    /// Whole attempt exceeded its budget
    ConnectionTimeout,
    /// Peer sent something the flow cannot use
    ProtocolError,
}

impl FailureReason {
    /// Whether the peer (or its credentials check) turned the attempt down
    pub fn is_rejection(self) -> bool {
        matches!(
            self,
            FailureReason::RemoteRejected | FailureReason::CredentialRejected
        )
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    SignalingConnecting,
    Negotiating,
    CandidateGathering,
    Connected { path: PathKind },
    Closing,
    Closed,
    Failed { reason: FailureReason },
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed { .. })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    /// Whether `self -> to` is a legal transition
    pub fn can_transition_to(&self, to: &ConnectionState) -> bool {
        use ConnectionState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (Closing, Closed) => true,
            (Closing, _) => false,
            (_, Failed { .. }) => true,
            (_, Closing) => true,
            (Idle, SignalingConnecting) => true,
            (SignalingConnecting, Negotiating) => true,
            (Negotiating, CandidateGathering) => true,
            (CandidateGathering, Connected { .. }) => true,
            _ => false,
        }
    }
}

/// Published on every state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    pub connection_id: String,
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub timestamp: DateTime<Utc>,
}

/// One peer-to-peer connection attempt and its outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConnection {
    pub connection_id: String,
    pub session_id: String,
    pub local_device_id: String,
    pub remote_device_id: String,
    pub state: ConnectionState,
    pub selected_candidate: Option<CandidatePair>,
    pub is_relay: bool,
    pub rtt_ms: Option<f64>,
    /// Set by the controlled side's answer
    pub require_lock_password_check: bool,
    #[serde(skip)]
    pub local_candidates: Vec<Candidate>,
    #[serde(skip)]
    pub remote_candidates: Vec<Candidate>,
}

/// Shared collaborators of every connection on one endpoint
#[derive(Clone)]
pub struct ConnectionDeps {
    pub config: IceConfig,
    pub handshake_timeout: Duration,
    pub negotiator: Arc<CandidateNegotiator>,
    pub channel: Arc<SignalingChannel>,
    pub events: EventBus,
    pub clock: Arc<dyn Clock>,
}

/// Failed flow step with the state it maps to
struct Failure {
    reason: FailureReason,
    error: Error,
}

impl Failure {
    fn new(reason: FailureReason, error: Error) -> Self {
        Self { reason, error }
    }

    /// Classify an error raised while waiting on signaling
    fn signaling(error: Error) -> Self {
        let reason = match error {
            Error::ConnectionTimeout(_) => FailureReason::SignalingTimeout,
            Error::SerializationError(_) => FailureReason::ProtocolError,
            _ => FailureReason::SignalingLost,
        };
        Self { reason, error }
    }
}

/// Drives one [`PeerConnection`] through its states
pub struct ConnectionStateMachine {
    conn: Mutex<PeerConnection>,
    state_tx: watch::Sender<ConnectionState>,
    signals: tokio::sync::Mutex<Option<SessionSignals>>,
    deps: ConnectionDeps,
}

impl std::fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("conn", &*self.conn.lock())
            .finish()
    }
}

impl ConnectionStateMachine {
    /// New machine in `Idle` for the signaling session `session_id`
    pub fn new(session_id: &str, remote_device_id: &str, deps: ConnectionDeps) -> Self {
        let conn = PeerConnection {
            connection_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            local_device_id: deps.channel.local_device_id().to_string(),
            remote_device_id: remote_device_id.to_string(),
            state: ConnectionState::Idle,
            selected_candidate: None,
            is_relay: false,
            rtt_ms: None,
            require_lock_password_check: false,
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
        };
        Self {
            conn: Mutex::new(conn),
            state_tx: watch::channel(ConnectionState::Idle).0,
            signals: tokio::sync::Mutex::new(None),
            deps,
        }
    }

    pub fn connection_id(&self) -> String {
        self.conn.lock().connection_id.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.lock().state
    }

    /// Copy of the connection record
    pub fn snapshot(&self) -> PeerConnection {
        self.conn.lock().clone()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Controller side: request control of the remote device and connect
    #[instrument(skip_all, fields(remote = %self.conn.lock().remote_device_id))]
    pub async fn connect(&self, request: ConnectRequestPayload) -> Result<PeerConnection> {
        self.transition(ConnectionState::SignalingConnecting)?;
        self.drive(self.controller_flow(request)).await
    }

    /// Controlled side: answer an inbound connect request
    ///
    /// `authorize` decides on the request and returns whether the controller
    /// must pass the OS lock password check.
    #[instrument(skip_all, fields(remote = %self.conn.lock().remote_device_id))]
    pub async fn accept<F>(&self, request: ConnectRequestPayload, authorize: F) -> Result<PeerConnection>
    where
        F: FnOnce(&ConnectRequestPayload) -> Result<bool> + Send,
    {
        self.transition(ConnectionState::SignalingConnecting)?;
        self.drive(self.controlled_flow(request, authorize)).await
    }

    async fn drive<Fut>(&self, flow: Fut) -> Result<PeerConnection>
    where
        Fut: Future<Output = std::result::Result<SelectedPath, Failure>>,
    {
        let mut state_rx = self.state_tx.subscribe();
        let connect_timeout = self.deps.config.connect_timeout();

        let outcome = tokio::select! {
            result = tokio::time::timeout(connect_timeout, flow) => match result {
                Ok(r) => r,
                Err(_) => Err(Failure::new(
                    FailureReason::ConnectionTimeout,
                    Error::ConnectionTimeout(format!("no connection after {:?}", connect_timeout)),
                )),
            },
            _ = state_rx.wait_for(|s| s.is_terminal()) => {
                let state = self.state();
                debug!("Connection attempt interrupted in {:?}", state);
                return Err(match state {
                    ConnectionState::Failed { reason: FailureReason::SignalingLost } => {
                        Error::SignalingUnavailable("signaling channel lost".to_string())
                    }
                    _ => Error::InvalidState("connection attempt cancelled".to_string()),
                });
            }
        };

        match outcome {
            Ok(path) => {
                let kind = if path.is_relay { PathKind::Relay } else { PathKind::Direct };
                self.transition_with(ConnectionState::Connected { path: kind }, |conn| {
                    conn.selected_candidate = Some(path.pair);
                    conn.is_relay = path.is_relay;
                    conn.rtt_ms = Some(path.rtt_ms);
                })?;
                info!("Connected via {:?} path", kind);
                Ok(self.snapshot())
            }
            Err(failure) => {
                self.signals.lock().await.take();
                if self.state() == ConnectionState::Closing {
                    debug!("Attempt cancelled while failing with {:?}", failure.reason);
                    return Err(Error::InvalidState("connection attempt cancelled".to_string()));
                }
                warn!("Connection failed ({:?}): {}", failure.reason, failure.error);
                self.fail(failure.reason);
                Err(failure.error)
            }
        }
    }

    async fn controller_flow(
        &self,
        request: ConnectRequestPayload,
    ) -> std::result::Result<SelectedPath, Failure> {
        let mut signals = self.open_signals()?;
        self.step(ConnectionState::Negotiating)?;

        signals
            .send(MessageType::ConnectRequest, &request)
            .await
            .map_err(Failure::signaling)?;
        let response = self
            .expect_message(&mut signals, MessageType::ConnectResponse)
            .await?;
        let response: ConnectResponsePayload = response
            .decode_payload()
            .map_err(|e| Failure::new(FailureReason::ProtocolError, e))?;
        if !response.accepted {
            let error = response.rejection_error();
            let reason = if error.is_authorization_error() {
                FailureReason::CredentialRejected
            } else {
                FailureReason::RemoteRejected
            };
            return Err(Failure::new(reason, error));
        }
        self.conn.lock().require_lock_password_check = response.require_lock_password_check;

        let connection_id = self.connection_id();
        let probe = self.deps.negotiator.probe();
        let sdp = probe
            .local_description(&connection_id)
            .await
            .map_err(|e| Failure::new(FailureReason::ProtocolError, e))?;
        signals
            .send(
                MessageType::Offer,
                &SessionDescriptionPayload {
                    connection_id: connection_id.clone(),
                    sdp,
                },
            )
            .await
            .map_err(Failure::signaling)?;
        let answer: SessionDescriptionPayload = self
            .expect_message(&mut signals, MessageType::Answer)
            .await?
            .decode_payload()
            .map_err(|e| Failure::new(FailureReason::ProtocolError, e))?;
        probe
            .apply_remote_description(&connection_id, &answer.sdp)
            .await
            .map_err(|e| Failure::new(FailureReason::ProtocolError, e))?;

        self.step(ConnectionState::CandidateGathering)?;
        let path = self.exchange_candidates(&mut signals).await;
        *self.signals.lock().await = Some(signals);
        path
    }

    async fn controlled_flow<F>(
        &self,
        request: ConnectRequestPayload,
        authorize: F,
    ) -> std::result::Result<SelectedPath, Failure>
    where
        F: FnOnce(&ConnectRequestPayload) -> Result<bool> + Send,
    {
        let mut signals = self.open_signals()?;
        self.step(ConnectionState::Negotiating)?;

        match authorize(&request) {
            Ok(require_lock) => {
                self.conn.lock().require_lock_password_check = require_lock;
                signals
                    .send(
                        MessageType::ConnectResponse,
                        &ConnectResponsePayload::accept(require_lock),
                    )
                    .await
                    .map_err(Failure::signaling)?;
            }
            Err(error) => {
                // best effort; the attempt fails either way
                let _ = signals
                    .send(MessageType::ConnectResponse, &ConnectResponsePayload::reject(&error))
                    .await;
                return Err(Failure::new(FailureReason::CredentialRejected, error));
            }
        }

        let offer: SessionDescriptionPayload = self
            .expect_message(&mut signals, MessageType::Offer)
            .await?
            .decode_payload()
            .map_err(|e| Failure::new(FailureReason::ProtocolError, e))?;

        let connection_id = self.connection_id();
        let probe = self.deps.negotiator.probe();
        probe
            .apply_remote_description(&connection_id, &offer.sdp)
            .await
            .map_err(|e| Failure::new(FailureReason::ProtocolError, e))?;
        let sdp = probe
            .local_description(&connection_id)
            .await
            .map_err(|e| Failure::new(FailureReason::ProtocolError, e))?;
        signals
            .send(
                MessageType::Answer,
                &SessionDescriptionPayload { connection_id, sdp },
            )
            .await
            .map_err(Failure::signaling)?;

        self.step(ConnectionState::CandidateGathering)?;
        let path = self.exchange_candidates(&mut signals).await;
        *self.signals.lock().await = Some(signals);
        path
    }

    fn open_signals(&self) -> std::result::Result<SessionSignals, Failure> {
        let (session_id, remote) = {
            let conn = self.conn.lock();
            (conn.session_id.clone(), conn.remote_device_id.clone())
        };
        self.deps
            .channel
            .open_session(&session_id, &remote)
            .map_err(Failure::signaling)
    }

    /// Wait for `expected` within the signaling handshake budget
    async fn expect_message(
        &self,
        signals: &mut SessionSignals,
        expected: MessageType,
    ) -> std::result::Result<SignalingMessage, Failure> {
        let deadline = Instant::now() + self.deps.handshake_timeout;
        let msg = signals
            .recv_expected(&[expected], deadline)
            .await
            .map_err(Failure::signaling)?;

        if msg.message_type == MessageType::Disconnect {
            let reason = msg
                .decode_payload::<DisconnectPayload>()
                .map(|d| d.reason)
                .unwrap_or_else(|_| "no reason".to_string());
            return Err(Failure::new(
                FailureReason::RemoteRejected,
                Error::SessionError(format!("remote disconnected: {}", reason)),
            ));
        }
        Ok(msg)
    }

    async fn exchange_candidates(
        &self,
        signals: &mut SessionSignals,
    ) -> std::result::Result<SelectedPath, Failure> {
        let local_device_id = self.conn.lock().local_device_id.clone();
        let local = self
            .deps
            .negotiator
            .gather(&local_device_id)
            .await
            .map_err(|e| Failure::new(FailureReason::NatTraversalFailed, e))?;
        self.conn.lock().local_candidates = local.clone();

        for candidate in &local {
            signals
                .send(
                    MessageType::IceCandidate,
                    &IceCandidatePayload {
                        candidate: Some(*candidate),
                    },
                )
                .await
                .map_err(Failure::signaling)?;
        }
        signals
            .send(MessageType::IceCandidate, &IceCandidatePayload { candidate: None })
            .await
            .map_err(Failure::signaling)?;

        let mut remote = Vec::new();
        loop {
            let msg = self.expect_message(signals, MessageType::IceCandidate).await?;
            let body: IceCandidatePayload = msg
                .decode_payload()
                .map_err(|e| Failure::new(FailureReason::ProtocolError, e))?;
            match body.candidate {
                Some(candidate) => remote.push(candidate),
                None => break,
            }
        }
        debug!("Received {} remote candidates", remote.len());
        self.conn.lock().remote_candidates = remote.clone();

        self.deps
            .negotiator
            .negotiate(&local, &remote)
            .await
            .map_err(|e| Failure::new(FailureReason::NatTraversalFailed, e))
    }

    /// Block until the connection ends, reacting to remote Disconnect and
    /// signaling loss. Returns the terminal state.
    pub async fn monitor(&self) -> ConnectionState {
        let Some(mut signals) = self.signals.lock().await.take() else {
            return self.state();
        };
        let mut state_rx = self.state_tx.subscribe();

        while !self.state().is_terminal() {
            tokio::select! {
                msg = signals.recv() => match msg {
                    Ok(msg) if msg.message_type == MessageType::Disconnect => {
                        info!("Remote peer disconnected");
                        self.on_remote_disconnect();
                    }
                    Ok(msg) => debug!("Ignoring {:?} on an established connection", msg.message_type),
                    Err(_) => self.on_signaling_lost(),
                },
                _ = state_rx.wait_for(|s| s.is_terminal()) => {}
            }
        }
        self.state()
    }

    /// Local disconnect; idempotent
    pub async fn disconnect(&self, reason: &str) -> Result<()> {
        let from = self.state();
        if from.is_terminal() || from == ConnectionState::Closing {
            return Ok(());
        }
        if self.transition(ConnectionState::Closing).is_err() {
            return Ok(());
        }

        if from != ConnectionState::Idle {
            let (session_id, local, remote) = {
                let conn = self.conn.lock();
                (
                    conn.session_id.clone(),
                    conn.local_device_id.clone(),
                    conn.remote_device_id.clone(),
                )
            };
            let notice = SignalingMessage::new(MessageType::Disconnect, local, remote, session_id)
                .with_payload(&DisconnectPayload {
                    reason: reason.to_string(),
                })?;
            if let Err(e) = self.deps.channel.send(notice).await {
                debug!("Disconnect notice not delivered: {}", e);
            }
        }

        let _ = self.transition(ConnectionState::Closed);
        info!("Connection closed: {}", reason);
        Ok(())
    }

    /// Abort an attempt in progress (or close an established connection)
    pub async fn cancel(&self) -> Result<()> {
        self.disconnect("cancelled").await
    }

    /// Peer sent Disconnect
    pub fn on_remote_disconnect(&self) {
        if self.transition(ConnectionState::Closing).is_ok() {
            let _ = self.transition(ConnectionState::Closed);
        }
    }

    /// Relay connection dropped
    pub fn on_signaling_lost(&self) {
        if self.state() != ConnectionState::Closing {
            self.fail(FailureReason::SignalingLost);
        }
    }

    /// Data channel dropped on an established connection
    ///
    /// Calls `reestablish` with backoff until it succeeds or the configured
    /// window runs out; in the latter case the connection closes.
    pub async fn on_data_channel_lost<F, Fut>(&self, mut reestablish: F) -> Result<()>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if !self.state().is_connected() {
            return Err(Error::InvalidState(format!(
                "data channel loss in state {:?}",
                self.state()
            )));
        }

        let policy = self.deps.config.reconnect.clone();
        let mut attempt = 0;
        while policy.should_retry(attempt) {
            tokio::time::sleep(policy.calculate_backoff(attempt)).await;
            if !self.state().is_connected() {
                return Err(Error::DataChannelClosed(
                    "connection closed during re-establishment".to_string(),
                ));
            }
            match reestablish(attempt).await {
                Ok(()) => {
                    info!("Data channel re-established after {} attempts", attempt + 1);
                    return Ok(());
                }
                Err(e) => warn!("Re-establishment attempt {} failed: {}", attempt + 1, e),
            }
            attempt += 1;
        }

        if self.transition(ConnectionState::Closing).is_ok() {
            let _ = self.transition(ConnectionState::Closed);
        }
        Err(Error::DataChannelClosed(format!(
            "no re-establishment after {} attempts",
            attempt
        )))
    }

    fn step(&self, to: ConnectionState) -> std::result::Result<(), Failure> {
        self.transition(to)
            .map_err(|e| Failure::new(FailureReason::ProtocolError, e))
    }

    fn fail(&self, reason: FailureReason) {
        let _ = self.transition(ConnectionState::Failed { reason });
    }

    fn transition(&self, to: ConnectionState) -> Result<()> {
        self.transition_with(to, |_| {})
    }

    fn transition_with(
        &self,
        to: ConnectionState,
        update: impl FnOnce(&mut PeerConnection),
    ) -> Result<()> {
        let event = {
            let mut conn = self.conn.lock();
            let from = conn.state;
            if !from.can_transition_to(&to) {
                return Err(Error::InvalidState(format!(
                    "connection {}: {:?} -> {:?}",
                    conn.connection_id, from, to
                )));
            }
            conn.state = to;
            update(&mut conn);
            if to.is_terminal() {
                conn.local_candidates.clear();
                conn.remote_candidates.clear();
            }
            self.state_tx.send_replace(to);
            ConnectionEvent {
                connection_id: conn.connection_id.clone(),
                from,
                to,
                timestamp: self.deps.clock.now(),
            }
        };

        debug!(
            "Connection {} {:?} -> {:?}",
            event.connection_id, event.from, event.to
        );
        self.deps.events.publish(EngineEvent::Connection(event));
        Ok(())
    }
}
