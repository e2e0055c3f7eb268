//! WebSocket signaling relay
//!
//! Each WebSocket connection carries JSON signaling envelopes for the devices
//! registered on it. Routing and presence live in
//! [`SignalingHub`](remotedesk_core::SignalingHub); this crate only moves
//! frames between sockets and the hub.

use futures::{SinkExt, StreamExt};
use remotedesk_core::signaling::hub::DeviceSender;
use remotedesk_core::signaling::{SignalingHub, SignalingMessage};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Message, Result as WsResult},
};
use tracing::{debug, error, info, warn};

/// Relay listening on one TCP socket
pub struct RelayServer {
    listener: TcpListener,
    hub: Arc<SignalingHub>,
    prune_interval: Duration,
}

impl RelayServer {
    pub async fn bind(addr: &str, hub: Arc<SignalingHub>, prune_interval: Duration) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            hub,
            prune_interval,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn hub(&self) -> &Arc<SignalingHub> {
        &self.hub
    }

    /// Accept connections until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        info!("Signaling relay listening on {}", self.listener.local_addr()?);

        let hub = Arc::clone(&self.hub);
        let period = self.prune_interval;
        let pruner = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let stale = hub.prune();
                if !stale.is_empty() {
                    debug!("Pruned {} stale devices", stale.len());
                }
            }
        });

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let hub = Arc::clone(&self.hub);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, hub).await {
                                debug!("Connection {} ended with error: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
                _ = &mut shutdown => {
                    info!("Shutdown requested, {} devices online", self.hub.online_count());
                    break;
                }
            }
        }

        pruner.abort();
        Ok(())
    }
}

/// Serve one WebSocket connection
pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, hub: Arc<SignalingHub>) -> WsResult<()> {
    let ws_stream = accept_async(stream).await?;
    info!("New signaling connection from {}", addr);
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (tx, mut rx): (DeviceSender, _) = mpsc::unbounded_channel::<SignalingMessage>();
    let forward_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match msg.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Dropping unencodable envelope: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::Text(text)).await {
                error!("Failed to send signaling frame: {}", e);
                break;
            }
        }
    });

    let mut registered: Vec<String> = Vec::new();
    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => match SignalingMessage::from_json(&text) {
                Ok(msg) => match hub.dispatch(&tx, msg) {
                    Ok(Some(device_id)) => {
                        if !registered.contains(&device_id) {
                            registered.push(device_id);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Rejected envelope from {}: {}", addr, e),
                },
                Err(e) => warn!("Malformed frame from {}: {}", addr, e),
            },
            Ok(Message::Close(_)) => {
                info!("Signaling connection closed by {}", addr);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                forward_task.abort();
                for device_id in &registered {
                    hub.unregister(device_id, &tx);
                }
                return Err(e);
            }
        }
    }

    for device_id in &registered {
        hub.unregister(device_id, &tx);
    }
    forward_task.abort();
    Ok(())
}
