//! Device endpoint
//!
//! Wires one device's credentials, signaling channel, connection state
//! machines, session manager and transfer engines together. Controllers call
//! [`Endpoint::start_session`]; controlled devices take requests from
//! [`Endpoint::next_connect_request`] and answer with
//! [`Endpoint::accept_session`] (or run [`Endpoint::run_acceptor`]).

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::credentials::{
    AccessCode, ConnectAuth, ConnectionCredential, CredentialIssuer, DeviceIdentity,
    RelayCredentialMinter, RelayCredentialProvider,
};
use crate::events::{EngineEvent, EventBus};
use crate::peer::{
    CandidateNegotiator, ConnectionDeps, ConnectionState, ConnectionStateMachine,
    ConnectivityProbe,
};
use crate::platform::{InputInjector, Notifier, ScreenCapture};
use crate::session::{
    EndReason, HistoryStore, Session, SessionId, SessionManager, SessionOptions,
    SessionPermissions, SessionRecord,
};
use crate::signaling::{
    ConnectRequestPayload, RegisterPayload, SignalingChannel, SignalingConnector,
    SignalingTransport,
};
use crate::transfer::{ChunkSinkFactory, ChunkTransport, TransferEngine};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Connections = Arc<Mutex<HashMap<SessionId, Arc<ConnectionStateMachine>>>>;

/// Everything an endpoint is built from
pub struct EndpointParts {
    pub config: EngineConfig,
    pub identity: DeviceIdentity,
    pub credential: ConnectionCredential,
    pub device_name: String,
    pub issuer: Arc<CredentialIssuer>,
    pub probe: Arc<dyn ConnectivityProbe>,
    pub history: Arc<dyn HistoryStore>,
    pub clock: Arc<dyn Clock>,
    pub events: EventBus,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub input: Option<Arc<dyn InputInjector>>,
    pub capture: Option<Arc<dyn ScreenCapture>>,
}

/// Connect request waiting for a decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    pub session_id: SessionId,
    pub from_device_id: String,
    pub request: ConnectRequestPayload,
}

/// One device's view of the engine
pub struct Endpoint {
    config: EngineConfig,
    identity: DeviceIdentity,
    credential: Mutex<ConnectionCredential>,
    issuer: Arc<CredentialIssuer>,
    channel: Arc<SignalingChannel>,
    negotiator: Arc<CandidateNegotiator>,
    sessions: Arc<SessionManager>,
    connections: Connections,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("device_id", &self.identity.device_id)
            .field("channel", &self.channel)
            .field("connections", &self.connections.lock().len())
            .finish()
    }
}

impl Endpoint {
    /// Connect to the first reachable relay and register
    pub async fn connect(parts: EndpointParts, connector: &dyn SignalingConnector) -> Result<Arc<Self>> {
        parts.config.validate()?;
        let channel =
            SignalingChannel::connect(connector, &parts.config.signaling, registration(&parts)).await?;
        Self::with_channel(parts, channel)
    }

    /// Register over an already open signaling transport
    pub async fn open(parts: EndpointParts, transport: Arc<dyn SignalingTransport>) -> Result<Arc<Self>> {
        parts.config.validate()?;
        let channel =
            SignalingChannel::open(transport, &parts.config.signaling, registration(&parts)).await?;
        Self::with_channel(parts, channel)
    }

    fn with_channel(parts: EndpointParts, channel: Arc<SignalingChannel>) -> Result<Arc<Self>> {
        let EndpointParts {
            config,
            identity,
            credential,
            issuer,
            probe,
            history,
            clock,
            events,
            notifier,
            input,
            capture,
            ..
        } = parts;

        let relay: Option<Arc<dyn RelayCredentialProvider>> =
            config.ice.turn_shared_secret.as_ref().map(|secret| {
                Arc::new(RelayCredentialMinter::new(
                    secret.as_bytes().to_vec(),
                    chrono::Duration::seconds(config.ice.relay_credential_ttl_secs as i64),
                    Arc::clone(&clock),
                )) as Arc<dyn RelayCredentialProvider>
            });
        let negotiator = Arc::new(CandidateNegotiator::new(config.ice.clone(), probe, relay));

        let mut sessions = SessionManager::new(
            identity.device_id.clone(),
            config.session.clone(),
            config.quality.clone(),
            history,
            events.clone(),
            Arc::clone(&clock),
        )?;
        if let Some(notifier) = notifier {
            sessions = sessions.with_notifier(notifier);
        }
        if let Some(input) = input {
            sessions = sessions.with_input_injector(input);
        }
        if let Some(capture) = capture {
            sessions = sessions.with_screen_capture(capture);
        }

        info!(
            "Endpoint {} ready (device code {})",
            identity.device_id, identity.device_code
        );
        Ok(Arc::new(Self {
            config,
            identity,
            credential: Mutex::new(credential),
            issuer,
            channel,
            negotiator,
            sessions: Arc::new(sessions),
            connections: Arc::new(Mutex::new(HashMap::new())),
            events,
            clock,
        }))
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn credential(&self) -> ConnectionCredential {
        self.credential.lock().clone()
    }

    pub fn set_allow_remote_control(&self, allow: bool) {
        self.credential.lock().allow_remote_control = allow;
    }

    pub fn set_require_lock_password_check(&self, require: bool) {
        self.credential.lock().require_lock_password_check = require;
    }

    /// Rotate the connection password; returns the new one
    pub fn refresh_password(&self) -> Result<String> {
        let mut credential = self.credential.lock();
        self.issuer.refresh(&mut credential)?;
        Ok(credential.connection_password.clone())
    }

    /// Issue a single-use access code for this device
    pub fn issue_access_code(&self) -> Result<AccessCode> {
        self.issuer.issue_access_code(&self.identity.device_id)
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn signaling(&self) -> &Arc<SignalingChannel> {
        &self.channel
    }

    /// Connection state of a session's peer connection
    pub fn connection_state(&self, session_id: &str) -> Option<ConnectionState> {
        self.connections.lock().get(session_id).map(|m| m.state())
    }

    /// Controller side: request control of `remote_device_id`
    ///
    /// Returns the active session once the peer connection is up. On failure
    /// the pending session is ended (Rejected or Timeout) and the error is
    /// returned.
    pub async fn start_session(
        &self,
        remote_device_id: &str,
        auth: ConnectAuth,
        permissions: SessionPermissions,
    ) -> Result<Session> {
        let session = self
            .sessions
            .create_session(
                remote_device_id,
                SessionOptions::controller().with_permissions(permissions),
            )
            .await?;
        let machine = self.register_machine(&session.session_id, remote_device_id);

        let request = ConnectRequestPayload { auth, permissions };
        match machine.connect(request).await {
            Ok(connection) => self.activate(&session.session_id, machine, &connection).await,
            Err(e) => {
                self.abandon(&session.session_id, &machine).await;
                Err(e)
            }
        }
    }

    /// Next connect request addressed to this device
    ///
    /// `None` once the signaling channel is closed.
    pub async fn next_connect_request(&self) -> Option<IncomingRequest> {
        loop {
            let msg = self.channel.next_incoming().await?;
            match msg.decode_payload::<ConnectRequestPayload>() {
                Ok(request) => {
                    return Some(IncomingRequest {
                        session_id: msg.session_id,
                        from_device_id: msg.from_device_id,
                        request,
                    })
                }
                Err(e) => warn!("Dropping malformed connect request from {}: {}", msg.from_device_id, e),
            }
        }
    }

    /// Controlled side: authorize and answer a connect request
    ///
    /// Remote control must be allowed before credentials are looked at.
    pub async fn accept_session(&self, incoming: IncomingRequest) -> Result<Session> {
        let IncomingRequest {
            session_id,
            from_device_id,
            request,
        } = incoming;
        self.sessions
            .create_session(
                &from_device_id,
                SessionOptions::controlled(session_id.clone(), request.permissions),
            )
            .await?;
        let machine = self.register_machine(&session_id, &from_device_id);

        let issuer = Arc::clone(&self.issuer);
        let identity = self.identity.clone();
        let credential = self.credential();
        let authorize = move |req: &ConnectRequestPayload| {
            issuer.authorize(&req.auth, &identity, &credential)?;
            Ok(credential.require_lock_password_check)
        };

        match machine.accept(request, authorize).await {
            Ok(connection) => self.activate(&session_id, machine, &connection).await,
            Err(e) => {
                info!("Declined session {} from {}: {}", session_id, from_device_id, e);
                self.abandon(&session_id, &machine).await;
                Err(e)
            }
        }
    }

    /// Accept every inbound request until the signaling channel closes
    pub fn run_acceptor(self: &Arc<Self>) -> JoinHandle<()> {
        let endpoint = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(incoming) = endpoint.next_connect_request().await {
                let endpoint = Arc::clone(&endpoint);
                tokio::spawn(async move {
                    let from = incoming.from_device_id.clone();
                    if let Err(e) = endpoint.accept_session(incoming).await {
                        debug!("Connect request from {} not accepted: {}", from, e);
                    }
                });
            }
            debug!("Acceptor stopped: signaling closed");
        })
    }

    /// Abort a connection attempt in progress; idempotent
    pub async fn cancel_connect(&self, session_id: &str) -> Result<()> {
        let machine = self.connections.lock().get(session_id).cloned();
        match machine {
            Some(machine) => machine.cancel().await,
            None => Ok(()),
        }
    }

    /// End a session locally and disconnect its peer connection
    pub async fn end_session(&self, session_id: &str) -> Result<SessionRecord> {
        let machine = self.connections.lock().remove(session_id);
        if let Some(machine) = machine {
            machine.disconnect("session ended").await?;
        }
        self.sessions.end_session(session_id, EndReason::UserEnded).await
    }

    /// Try to restore a dropped data channel within the reconnect window
    ///
    /// On success the session is re-associated with the connection; otherwise
    /// it ends as `ConnectionLost`.
    pub async fn recover_data_channel<F, Fut>(&self, session_id: &str, reestablish: F) -> Result<Session>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let machine = self
            .connections
            .lock()
            .remove(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        match machine.on_data_channel_lost(reestablish).await {
            Ok(()) => {
                self.connections
                    .lock()
                    .insert(session_id.to_string(), Arc::clone(&machine));
                self.sessions
                    .reassociate_connection(session_id, &machine.snapshot())
                    .await
            }
            Err(e) => {
                self.sessions
                    .end_session(session_id, EndReason::ConnectionLost)
                    .await?;
                Err(e)
            }
        }
    }

    /// Transfer engine for a live session that allows file transfer
    pub async fn transfer_engine(
        &self,
        session_id: &str,
        transport: Arc<dyn ChunkTransport>,
        sinks: Option<Arc<dyn ChunkSinkFactory>>,
    ) -> Result<TransferEngine> {
        let session = self.sessions.get_session(session_id).await?;
        if !session.status.is_live() {
            return Err(Error::InvalidState(format!(
                "session {} is {:?}",
                session_id, session.status
            )));
        }
        if !session.permissions.allow_file_transfer {
            return Err(Error::DeviceUnauthorized(format!(
                "file transfer not permitted in session {}",
                session_id
            )));
        }
        Ok(TransferEngine::new(
            self.config.transfer.clone(),
            transport,
            sinks,
            self.events.clone(),
            Arc::clone(&self.clock),
        ))
    }

    /// End every session and close the signaling channel
    pub async fn shutdown(&self) {
        let machines: Vec<_> = self.connections.lock().drain().collect();
        for (session_id, machine) in machines {
            if let Err(e) = machine.disconnect("shutting down").await {
                debug!("Disconnect of {} during shutdown: {}", session_id, e);
            }
            if let Err(e) = self.sessions.end_session(&session_id, EndReason::UserEnded).await {
                debug!("Ending {} during shutdown: {}", session_id, e);
            }
        }
        self.channel.close().await;
        info!("Endpoint {} shut down", self.identity.device_id);
    }

    fn register_machine(&self, session_id: &str, remote_device_id: &str) -> Arc<ConnectionStateMachine> {
        let deps = ConnectionDeps {
            config: self.config.ice.clone(),
            handshake_timeout: self.config.signaling.handshake_timeout(),
            negotiator: Arc::clone(&self.negotiator),
            channel: Arc::clone(&self.channel),
            events: self.events.clone(),
            clock: Arc::clone(&self.clock),
        };
        let machine = Arc::new(ConnectionStateMachine::new(session_id, remote_device_id, deps));
        self.connections
            .lock()
            .insert(session_id.to_string(), Arc::clone(&machine));
        machine
    }

    async fn activate(
        &self,
        session_id: &str,
        machine: Arc<ConnectionStateMachine>,
        connection: &crate::peer::PeerConnection,
    ) -> Result<Session> {
        let session = match self.sessions.join_session(session_id, connection).await {
            Ok(session) => session,
            Err(e) => {
                self.connections.lock().remove(session_id);
                let _ = machine.disconnect("session unavailable").await;
                let _ = self.sessions.end_session(session_id, EndReason::UserEnded).await;
                return Err(e);
            }
        };

        let sessions = Arc::clone(&self.sessions);
        let connections = Arc::clone(&self.connections);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let end = machine.monitor().await;
            let owned = {
                let mut connections = connections.lock();
                match connections.get(&session_id) {
                    Some(current) if Arc::ptr_eq(current, &machine) => {
                        connections.remove(&session_id);
                        true
                    }
                    _ => false,
                }
            };
            if !owned {
                return;
            }
            let result = match end {
                ConnectionState::Failed { reason } => {
                    sessions.on_connection_failed(&session_id, reason).await
                }
                _ => sessions.end_session(&session_id, EndReason::RemoteEnded).await,
            };
            if let Err(e) = result {
                debug!("Session {} already finished: {}", session_id, e);
            }
        });
        Ok(session)
    }

    /// A connection attempt failed before the session went active
    async fn abandon(&self, session_id: &str, machine: &Arc<ConnectionStateMachine>) {
        self.connections.lock().remove(session_id);
        let outcome = match machine.state() {
            ConnectionState::Failed { reason } => {
                self.sessions.on_connection_failed(session_id, reason).await
            }
            _ => self.sessions.end_session(session_id, EndReason::UserEnded).await,
        };
        if let Err(e) = outcome {
            debug!("Session {} cleanup: {}", session_id, e);
        }
    }
}

fn registration(parts: &EndpointParts) -> RegisterPayload {
    RegisterPayload {
        device_id: parts.identity.device_id.clone(),
        device_name: parts.device_name.clone(),
        platform: parts.identity.platform_tag,
        version: crate::version().to_string(),
        capabilities: vec!["remote_control".to_string(), "file_transfer".to_string()],
    }
}
