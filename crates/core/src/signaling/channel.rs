//! Device-side signaling channel
//!
//! Owns one relay transport for the local device, registers on open and
//! keeps presence alive with heartbeats. Inbound envelopes are demultiplexed
//! by session id: each connection attempt opens a [`SessionSignals`] route,
//! and connect requests for sessions nobody is waiting on are queued for
//! [`SignalingChannel::next_incoming`].

use super::protocol::{MessageType, RegisterPayload, SignalingMessage, RELAY_DEVICE_ID};
use super::transport::{connect_with_failover, SignalingConnector, SignalingTransport};
use crate::config::SignalingConfig;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

type Routes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<SignalingMessage>>>>;

/// Transport that finished the registration handshake
struct Registered {
    device_id: String,
    transport: Arc<dyn SignalingTransport>,
    incoming_tx: mpsc::UnboundedSender<SignalingMessage>,
    incoming_rx: mpsc::UnboundedReceiver<SignalingMessage>,
}

/// Persistent signaling channel of the local device
pub struct SignalingChannel {
    local_device_id: String,
    relay_url: Option<String>,
    transport: Arc<dyn SignalingTransport>,
    routes: Routes,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<SignalingMessage>>,
    connected: Arc<watch::Sender<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("local_device_id", &self.local_device_id)
            .field("relay_url", &self.relay_url)
            .field("connected", &*self.connected.borrow())
            .finish()
    }
}

impl SignalingChannel {
    /// Connect to the first reachable relay and register
    pub async fn connect(
        connector: &dyn SignalingConnector,
        config: &SignalingConfig,
        registration: RegisterPayload,
    ) -> Result<Arc<Self>> {
        let (url, transport) =
            connect_with_failover(connector, &config.relay_urls, &config.failover).await?;
        let registered = register(transport, config, registration).await?;
        Ok(Self::start(registered, Some(url), config.heartbeat_interval()))
    }

    /// Register over an already open transport
    pub async fn open(
        transport: Arc<dyn SignalingTransport>,
        config: &SignalingConfig,
        registration: RegisterPayload,
    ) -> Result<Arc<Self>> {
        let registered = register(transport, config, registration).await?;
        Ok(Self::start(registered, None, config.heartbeat_interval()))
    }

    fn start(registered: Registered, relay_url: Option<String>, heartbeat: Duration) -> Arc<Self> {
        let Registered {
            device_id,
            transport,
            incoming_tx,
            incoming_rx,
        } = registered;

        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(watch::channel(true).0);

        let pump = tokio::spawn(pump(
            Arc::clone(&transport),
            Arc::clone(&routes),
            incoming_tx,
            Arc::clone(&connected),
        ));
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&transport),
            device_id.clone(),
            heartbeat,
        ));

        Arc::new(Self {
            local_device_id: device_id,
            relay_url,
            transport,
            routes,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            connected,
            tasks: Mutex::new(vec![pump, heartbeat]),
        })
    }

    /// Local device id
    pub fn local_device_id(&self) -> &str {
        &self.local_device_id
    }

    /// Relay URL in use, when connected through a connector
    pub fn relay_url(&self) -> Option<&str> {
        self.relay_url.as_deref()
    }

    /// Whether the relay connection is still up
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Resolve once the relay connection is lost
    pub async fn closed(&self) {
        let mut connected = self.connected.subscribe();
        while *connected.borrow_and_update() {
            if connected.changed().await.is_err() {
                return;
            }
        }
    }

    /// Send a raw envelope
    pub async fn send(&self, msg: SignalingMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::SignalingUnavailable("signaling channel lost".to_string()));
        }
        self.transport.send(msg).await
    }

    /// Route every envelope for `session_id` to the returned handle
    pub fn open_session(&self, session_id: &str, remote_device_id: &str) -> Result<SessionSignals> {
        if !self.is_connected() {
            return Err(Error::SignalingUnavailable("signaling channel lost".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.routes.lock();
        if routes.contains_key(session_id) {
            return Err(Error::InvalidState(format!(
                "session {} already has a signaling route",
                session_id
            )));
        }
        routes.insert(session_id.to_string(), tx);
        debug!("Opened signaling route for session {}", session_id);

        Ok(SessionSignals {
            session_id: session_id.to_string(),
            local_device_id: self.local_device_id.clone(),
            remote_device_id: remote_device_id.to_string(),
            transport: Arc::clone(&self.transport),
            routes: Arc::clone(&self.routes),
            rx,
        })
    }

    /// Next connect request not claimed by an open session
    ///
    /// `None` once the channel is closed.
    pub async fn next_incoming(&self) -> Option<SignalingMessage> {
        self.incoming.lock().await.recv().await
    }

    /// Close the relay connection
    pub async fn close(&self) {
        self.connected.send_replace(false);
        self.transport.close().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.routes.lock().clear();
        info!("Signaling channel closed");
    }
}

#[instrument(skip_all, fields(device_id = %registration.device_id))]
async fn register(
    transport: Arc<dyn SignalingTransport>,
    config: &SignalingConfig,
    registration: RegisterPayload,
) -> Result<Registered> {
    let device_id = registration.device_id.clone();
    let register = SignalingMessage::new(MessageType::Register, &device_id, RELAY_DEVICE_ID, "")
        .with_payload(&registration)?;
    transport.send(register).await?;

    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let handshake = async {
        loop {
            match transport.recv().await {
                Some(msg) if msg.is_from_relay() && msg.message_type == MessageType::Register => {
                    return Ok(());
                }
                Some(msg) => {
                    let _ = incoming_tx.send(msg);
                }
                None => {
                    return Err(Error::SignalingUnavailable(
                        "relay closed during registration".to_string(),
                    ))
                }
            }
        }
    };

    match tokio::time::timeout(config.handshake_timeout(), handshake).await {
        Ok(result) => result?,
        Err(_) => {
            transport.close().await;
            return Err(Error::SignalingUnavailable(format!(
                "registration handshake timed out after {:?}",
                config.handshake_timeout()
            )));
        }
    }
    info!("Registered with signaling relay");

    Ok(Registered {
        device_id,
        transport,
        incoming_tx,
        incoming_rx,
    })
}

async fn pump(
    transport: Arc<dyn SignalingTransport>,
    routes: Routes,
    incoming: mpsc::UnboundedSender<SignalingMessage>,
    connected: Arc<watch::Sender<bool>>,
) {
    while let Some(msg) = transport.recv().await {
        if msg.is_from_relay()
            && matches!(msg.message_type, MessageType::Register | MessageType::Heartbeat)
        {
            trace!("Relay ack {:?}", msg.message_type);
            continue;
        }

        let route = routes.lock().get(&msg.session_id).cloned();
        match route {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    debug!("Session route dropped while delivering");
                }
            }
            None if msg.message_type == MessageType::ConnectRequest => {
                let _ = incoming.send(msg);
            }
            None => warn!(
                "No route for {:?} in session {}",
                msg.message_type, msg.session_id
            ),
        }
    }

    warn!("Signaling channel lost");
    connected.send_replace(false);
    // dropping the senders ends every open session route
    routes.lock().clear();
}

async fn heartbeat_loop(transport: Arc<dyn SignalingTransport>, device_id: String, every: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    loop {
        ticker.tick().await;
        let beat = SignalingMessage::new(MessageType::Heartbeat, &device_id, RELAY_DEVICE_ID, "");
        if let Err(e) = transport.send(beat).await {
            debug!("Heartbeat stopped: {}", e);
            break;
        }
    }
}

/// Signaling route of one session
pub struct SessionSignals {
    session_id: String,
    local_device_id: String,
    remote_device_id: String,
    transport: Arc<dyn SignalingTransport>,
    routes: Routes,
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
}

impl std::fmt::Debug for SessionSignals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSignals")
            .field("session_id", &self.session_id)
            .field("local_device_id", &self.local_device_id)
            .field("remote_device_id", &self.remote_device_id)
            .finish()
    }
}

impl SessionSignals {
    /// Session this route belongs to
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Peer device
    pub fn remote_device_id(&self) -> &str {
        &self.remote_device_id
    }

    /// Send a typed envelope to the peer
    pub async fn send<T: Serialize>(&self, message_type: MessageType, body: &T) -> Result<()> {
        let msg = SignalingMessage::new(
            message_type,
            &self.local_device_id,
            &self.remote_device_id,
            &self.session_id,
        )
        .with_payload(body)?;
        self.transport.send(msg).await
    }

    /// Next envelope for this session; errors once signaling is lost
    pub async fn recv(&mut self) -> Result<SignalingMessage> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| Error::SignalingUnavailable("signaling channel lost".to_string()))
    }

    /// Wait for one of `expected` (or a Disconnect) until `deadline`
    ///
    /// Other message types are skipped.
    pub async fn recv_expected(
        &mut self,
        expected: &[MessageType],
        deadline: Instant,
    ) -> Result<SignalingMessage> {
        loop {
            let msg = tokio::time::timeout_at(deadline, self.recv())
                .await
                .map_err(|_| {
                    Error::ConnectionTimeout(format!("waiting for {:?}", expected))
                })??;

            if expected.contains(&msg.message_type) || msg.message_type == MessageType::Disconnect {
                return Ok(msg);
            }
            debug!(
                "Skipping unexpected {:?} in session {}",
                msg.message_type, self.session_id
            );
        }
    }
}

impl Drop for SessionSignals {
    fn drop(&mut self) {
        self.routes.lock().remove(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::credentials::PlatformTag;
    use crate::signaling::hub::SignalingHub;
    use crate::signaling::protocol::DisconnectPayload;
    use chrono::Utc;

    fn registration(id: &str) -> RegisterPayload {
        RegisterPayload {
            device_id: id.to_string(),
            device_name: format!("{} desktop", id),
            platform: PlatformTag::Linux,
            version: "0.1.0".to_string(),
            capabilities: vec!["file_transfer".to_string()],
        }
    }

    fn hub() -> Arc<SignalingHub> {
        Arc::new(SignalingHub::new(
            chrono::Duration::seconds(45),
            Arc::new(ManualClock::new(Utc::now())),
        ))
    }

    #[tokio::test]
    async fn test_open_registers_with_hub() {
        let hub = hub();
        let channel = SignalingChannel::open(hub.attach(), &SignalingConfig::default(), registration("a"))
            .await
            .unwrap();
        assert!(channel.is_connected());
        assert!(hub.is_online("a"));
    }

    /// Transport that swallows everything and never answers
    struct SilentTransport;

    #[async_trait::async_trait]
    impl SignalingTransport for SilentTransport {
        async fn send(&self, _msg: SignalingMessage) -> Result<()> {
            Ok(())
        }
        async fn recv(&self) -> Option<SignalingMessage> {
            std::future::pending().await
        }
        async fn close(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let err = SignalingChannel::open(
            Arc::new(SilentTransport),
            &SignalingConfig::default(),
            registration("a"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::SignalingUnavailable(_)));
    }

    #[tokio::test]
    async fn test_session_routing_and_incoming() {
        let hub = hub();
        let config = SignalingConfig::default();
        let a = SignalingChannel::open(hub.attach(), &config, registration("a")).await.unwrap();
        let b = SignalingChannel::open(hub.attach(), &config, registration("b")).await.unwrap();

        let mut a_session = a.open_session("s1", "b").unwrap();
        a_session
            .send(MessageType::ConnectRequest, &serde_json::json!({}))
            .await
            .unwrap();

        let request = b.next_incoming().await.unwrap();
        assert_eq!(request.message_type, MessageType::ConnectRequest);
        assert_eq!(request.session_id, "s1");

        let b_session = b.open_session("s1", "a").unwrap();
        b_session
            .send(
                MessageType::Disconnect,
                &DisconnectPayload {
                    reason: "bye".into(),
                },
            )
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        let msg = a_session
            .recv_expected(&[MessageType::ConnectResponse], deadline)
            .await
            .unwrap();
        assert_eq!(msg.message_type, MessageType::Disconnect);
    }

    #[tokio::test]
    async fn test_duplicate_route_rejected_and_released_on_drop() {
        let hub = hub();
        let a = SignalingChannel::open(hub.attach(), &SignalingConfig::default(), registration("a"))
            .await
            .unwrap();
        let first = a.open_session("s1", "b").unwrap();
        assert!(a.open_session("s1", "b").is_err());
        drop(first);
        assert!(a.open_session("s1", "b").is_ok());
    }

    #[tokio::test]
    async fn test_transport_loss_ends_routes() {
        let hub = hub();
        let transport = hub.attach();
        let a = SignalingChannel::open(transport.clone(), &SignalingConfig::default(), registration("a"))
            .await
            .unwrap();
        let mut session = a.open_session("s1", "b").unwrap();

        transport.close().await;
        assert!(matches!(
            session.recv().await,
            Err(Error::SignalingUnavailable(_))
        ));
        a.closed().await;
        assert!(!a.is_connected());
    }
}
