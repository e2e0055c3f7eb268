//! Relay-side routing core
//!
//! Tracks which devices are online and forwards envelopes by `toDeviceId`.
//! The relay service wraps it with WebSocket I/O; tests and single-process
//! setups attach through [`SignalingHub::attach`].

use super::protocol::{
    ConnectResponsePayload, MessageType, SignalingMessage, RELAY_DEVICE_ID,
};
use super::transport::SignalingTransport;
use crate::clock::Clock;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Outbound queue towards one connected device
pub type DeviceSender = mpsc::UnboundedSender<SignalingMessage>;

#[derive(Debug)]
struct Presence {
    tx: DeviceSender,
    last_seen: DateTime<Utc>,
}

/// Presence table and router
#[derive(Debug)]
pub struct SignalingHub {
    presence: RwLock<HashMap<String, Presence>>,
    presence_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl SignalingHub {
    /// Create a hub that forgets devices silent for longer than `presence_ttl`
    pub fn new(presence_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            presence: RwLock::new(HashMap::new()),
            presence_ttl,
            clock,
        }
    }

    /// Handle one envelope received on the connection whose outbound queue is `reply`
    ///
    /// Returns the device id when the envelope registered a device.
    pub fn dispatch(&self, reply: &DeviceSender, msg: SignalingMessage) -> Result<Option<String>> {
        match msg.message_type {
            MessageType::Register => {
                let device_id = msg.from_device_id.clone();
                if device_id.is_empty() || device_id == RELAY_DEVICE_ID {
                    return Err(Error::InvalidState(format!(
                        "cannot register device id {:?}",
                        device_id
                    )));
                }
                let now = self.clock.now();
                {
                    let mut presence = self.presence.write();
                    if let Some(p) = presence.get(&device_id) {
                        let live = !p.tx.is_closed() && p.last_seen >= now - self.presence_ttl;
                        if live && !p.tx.same_channel(reply) {
                            warn!("Refusing to rebind device {} held by another connection", device_id);
                            return Err(Error::DeviceUnauthorized(format!(
                                "device {} is registered on another connection",
                                device_id
                            )));
                        }
                    }
                    presence.insert(
                        device_id.clone(),
                        Presence {
                            tx: reply.clone(),
                            last_seen: now,
                        },
                    );
                }
                info!("Device {} registered", device_id);
                self.ack(reply, &msg);
                Ok(Some(device_id))
            }
            MessageType::Heartbeat => {
                let known = match self.presence.write().get_mut(&msg.from_device_id) {
                    Some(p) if p.tx.same_channel(reply) => {
                        p.last_seen = self.clock.now();
                        true
                    }
                    _ => false,
                };
                if !known {
                    return Err(Error::InvalidState(format!(
                        "heartbeat from unregistered device {}",
                        msg.from_device_id
                    )));
                }
                self.ack(reply, &msg);
                Ok(None)
            }
            _ => {
                self.ensure_sender(reply, &msg.from_device_id)?;
                self.route(reply, msg)?;
                Ok(None)
            }
        }
    }

    fn ensure_sender(&self, reply: &DeviceSender, device_id: &str) -> Result<()> {
        match self.presence.read().get(device_id) {
            Some(p) if p.tx.same_channel(reply) => Ok(()),
            _ => Err(Error::InvalidState(format!(
                "device {} is not registered on this connection",
                device_id
            ))),
        }
    }

    fn route(&self, reply: &DeviceSender, msg: SignalingMessage) -> Result<()> {
        let target = self
            .presence
            .read()
            .get(&msg.to_device_id)
            .map(|p| p.tx.clone());

        match target {
            Some(tx) => {
                debug!(
                    "Routing {:?} {} -> {}",
                    msg.message_type, msg.from_device_id, msg.to_device_id
                );
                if tx.send(msg).is_err() {
                    warn!("Dropping envelope: target connection closed");
                }
                Ok(())
            }
            None if msg.message_type == MessageType::ConnectRequest => {
                let offline = Error::SignalingUnavailable(format!(
                    "device {} is offline",
                    msg.to_device_id
                ));
                debug!("{}", offline);
                let response = SignalingMessage::new(
                    MessageType::ConnectResponse,
                    RELAY_DEVICE_ID,
                    msg.from_device_id.clone(),
                    msg.session_id.clone(),
                )
                .with_payload(&ConnectResponsePayload::reject(&offline))?;
                let _ = reply.send(response);
                Ok(())
            }
            None => {
                warn!(
                    "Dropping {:?} for offline device {}",
                    msg.message_type, msg.to_device_id
                );
                Ok(())
            }
        }
    }

    fn ack(&self, reply: &DeviceSender, msg: &SignalingMessage) {
        let ack = SignalingMessage::new(
            msg.message_type,
            RELAY_DEVICE_ID,
            msg.from_device_id.clone(),
            msg.session_id.clone(),
        );
        let _ = reply.send(ack);
    }

    /// Remove a device, but only if it is still bound to `reply`
    pub fn unregister(&self, device_id: &str, reply: &DeviceSender) -> bool {
        let mut presence = self.presence.write();
        match presence.get(device_id) {
            Some(p) if p.tx.same_channel(reply) => {
                presence.remove(device_id);
                info!("Device {} went offline", device_id);
                true
            }
            _ => false,
        }
    }

    /// Drop devices that missed heartbeats for longer than the presence TTL
    pub fn prune(&self) -> Vec<String> {
        let cutoff = self.clock.now() - self.presence_ttl;
        let mut presence = self.presence.write();
        let stale: Vec<String> = presence
            .iter()
            .filter(|(_, p)| p.last_seen < cutoff || p.tx.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            presence.remove(id);
            info!("Pruned stale device {}", id);
        }
        stale
    }

    /// Whether `device_id` is online
    pub fn is_online(&self, device_id: &str) -> bool {
        self.presence.read().contains_key(device_id)
    }

    /// Number of online devices
    pub fn online_count(&self) -> usize {
        self.presence.read().len()
    }

    /// Open an in-process connection to the hub
    pub fn attach(self: &Arc<Self>) -> Arc<HubTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(HubTransport {
            hub: Arc::clone(self),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            registered: Mutex::new(Vec::new()),
            closed: watch::channel(false).0,
        })
    }
}

/// In-process transport bound to a [`SignalingHub`]
#[derive(Debug)]
pub struct HubTransport {
    hub: Arc<SignalingHub>,
    tx: DeviceSender,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SignalingMessage>>,
    registered: Mutex<Vec<String>>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl SignalingTransport for HubTransport {
    async fn send(&self, msg: SignalingMessage) -> Result<()> {
        if let Some(id) = self.hub.dispatch(&self.tx, msg)? {
            self.registered.lock().push(id);
        }
        Ok(())
    }

    async fn recv(&self) -> Option<SignalingMessage> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return None;
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            msg = rx.recv() => msg,
            _ = closed.changed() => None,
        }
    }

    async fn close(&self) {
        let ids = std::mem::take(&mut *self.registered.lock());
        for id in ids {
            self.hub.unregister(&id, &self.tx);
        }
        self.closed.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn hub() -> (Arc<ManualClock>, Arc<SignalingHub>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let hub = Arc::new(SignalingHub::new(Duration::seconds(45), clock.clone()));
        (clock, hub)
    }

    fn register(from: &str) -> SignalingMessage {
        SignalingMessage::new(MessageType::Register, from, "", "")
    }

    #[tokio::test]
    async fn test_register_is_acknowledged() {
        let (_, hub) = hub();
        let a = hub.attach();
        a.send(register("dev-a")).await.unwrap();

        let ack = a.recv().await.unwrap();
        assert_eq!(ack.message_type, MessageType::Register);
        assert!(ack.is_from_relay());
        assert_eq!(ack.to_device_id, "dev-a");
        assert!(hub.is_online("dev-a"));
    }

    #[tokio::test]
    async fn test_routes_by_target() {
        let (_, hub) = hub();
        let a = hub.attach();
        let b = hub.attach();
        a.send(register("dev-a")).await.unwrap();
        b.send(register("dev-b")).await.unwrap();
        a.recv().await.unwrap();
        b.recv().await.unwrap();

        a.send(SignalingMessage::new(MessageType::Offer, "dev-a", "dev-b", "s1"))
            .await
            .unwrap();
        let got = b.recv().await.unwrap();
        assert_eq!(got.message_type, MessageType::Offer);
        assert_eq!(got.from_device_id, "dev-a");
    }

    #[tokio::test]
    async fn test_connect_request_to_offline_device_is_rejected() {
        let (_, hub) = hub();
        let a = hub.attach();
        a.send(register("dev-a")).await.unwrap();
        a.recv().await.unwrap();

        a.send(SignalingMessage::new(
            MessageType::ConnectRequest,
            "dev-a",
            "ghost",
            "s1",
        ))
        .await
        .unwrap();

        let response = a.recv().await.unwrap();
        assert_eq!(response.message_type, MessageType::ConnectResponse);
        let body: ConnectResponsePayload = response.decode_payload().unwrap();
        assert!(!body.accepted);
        assert_eq!(body.error_code, Some(1002));
    }

    #[tokio::test]
    async fn test_spoofed_sender_rejected() {
        let (_, hub) = hub();
        let a = hub.attach();
        let b = hub.attach();
        a.send(register("dev-a")).await.unwrap();
        b.send(register("dev-b")).await.unwrap();

        let spoof = SignalingMessage::new(MessageType::Offer, "dev-a", "dev-b", "s1");
        assert!(b.send(spoof).await.is_err());
    }

    #[tokio::test]
    async fn test_register_cannot_take_over_live_device() {
        let (_, hub) = hub();
        let victim = hub.attach();
        let controller = hub.attach();
        let thief = hub.attach();
        victim.send(register("victim")).await.unwrap();
        controller.send(register("ctl")).await.unwrap();
        victim.recv().await.unwrap();
        controller.recv().await.unwrap();

        assert!(matches!(
            thief.send(register("victim")).await,
            Err(Error::DeviceUnauthorized(_))
        ));

        controller
            .send(SignalingMessage::new(MessageType::ConnectRequest, "ctl", "victim", "s1"))
            .await
            .unwrap();
        let got = victim.recv().await.unwrap();
        assert_eq!(got.message_type, MessageType::ConnectRequest);
        assert!(thief.rx.lock().await.try_recv().is_err());

        // the same connection may register again
        victim.send(register("victim")).await.unwrap();
        assert!(victim.recv().await.unwrap().is_from_relay());
    }

    #[tokio::test]
    async fn test_register_rebinds_after_old_connection_closes() {
        let (_, hub) = hub();
        let old = hub.attach();
        old.send(register("dev-a")).await.unwrap();
        // connection gone without an unregister
        drop(old);

        let fresh = hub.attach();
        fresh.send(register("dev-a")).await.unwrap();
        assert!(fresh.recv().await.unwrap().is_from_relay());
        assert!(hub.is_online("dev-a"));
    }

    #[tokio::test]
    async fn test_prune_and_heartbeat() {
        let (clock, hub) = hub();
        let a = hub.attach();
        let b = hub.attach();
        a.send(register("dev-a")).await.unwrap();
        b.send(register("dev-b")).await.unwrap();

        clock.advance(Duration::seconds(30));
        a.send(SignalingMessage::new(MessageType::Heartbeat, "dev-a", RELAY_DEVICE_ID, ""))
            .await
            .unwrap();
        clock.advance(Duration::seconds(30));

        assert_eq!(hub.prune(), vec!["dev-b".to_string()]);
        assert!(hub.is_online("dev-a"));
    }

    #[tokio::test]
    async fn test_close_unregisters() {
        let (_, hub) = hub();
        let a = hub.attach();
        a.send(register("dev-a")).await.unwrap();
        a.close().await;
        assert!(!hub.is_online("dev-a"));
    }
}
