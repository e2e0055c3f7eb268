//! Signaling transports
//!
//! A transport moves whole [`SignalingMessage`] envelopes. The WebSocket
//! implementation talks to a remote relay; the hub module provides an
//! in-process one.

use super::protocol::SignalingMessage;
use crate::lifecycle::BackoffPolicy;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Bidirectional envelope channel to a relay
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Send one envelope
    async fn send(&self, msg: SignalingMessage) -> Result<()>;

    /// Next envelope; `None` once the transport is closed
    async fn recv(&self) -> Option<SignalingMessage>;

    /// Close the transport
    async fn close(&self);
}

/// Opens transports to relay URLs
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Open a transport to `url`
    async fn connect(&self, url: &str) -> Result<Arc<dyn SignalingTransport>>;
}

/// Walk `urls` in order, with backoff between full rounds
///
/// Returns the first transport that opens together with its URL.
pub async fn connect_with_failover(
    connector: &dyn SignalingConnector,
    urls: &[String],
    backoff: &BackoffPolicy,
) -> Result<(String, Arc<dyn SignalingTransport>)> {
    if urls.is_empty() {
        return Err(Error::SignalingUnavailable(
            "no relay urls configured".to_string(),
        ));
    }

    let mut round = 0;
    loop {
        for url in urls {
            match connector.connect(url).await {
                Ok(transport) => {
                    info!("Connected to signaling relay {}", url);
                    return Ok((url.clone(), transport));
                }
                Err(e) => warn!("Signaling relay {} unavailable: {}", url, e),
            }
        }

        if !backoff.should_retry(round) {
            return Err(Error::SignalingUnavailable(format!(
                "all {} relays failed after {} rounds",
                urls.len(),
                round + 1
            )));
        }
        let delay = backoff.calculate_backoff(round);
        debug!("Retrying relays in {:?}", delay);
        tokio::time::sleep(delay).await;
        round += 1;
    }
}

/// WebSocket transport, one JSON envelope per text frame
pub struct WebSocketTransport {
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<mpsc::UnboundedReceiver<SignalingMessage>>,
}

impl WebSocketTransport {
    /// Connect to a relay at `url`
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::SignalingUnavailable(format!("{}: {}", url, e)))?;

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    error!("Failed to send signaling frame: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            debug!("Signaling sender task terminated");
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match SignalingMessage::from_json(&text) {
                        Ok(msg) => {
                            if in_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Dropping malformed signaling frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        info!("Signaling relay closed the connection");
                        break;
                    }
                    Err(e) => {
                        error!("Signaling WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            debug!("Signaling receiver task terminated");
        });

        Ok(Self {
            tx: out_tx,
            rx: Mutex::new(in_rx),
        })
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn send(&self, msg: SignalingMessage) -> Result<()> {
        let text = msg.to_json()?;
        self.tx
            .send(Message::Text(text))
            .map_err(|_| Error::SignalingUnavailable("signaling connection closed".to_string()))
    }

    async fn recv(&self) -> Option<SignalingMessage> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) {
        let _ = self.tx.send(Message::Close(None));
    }
}

/// Connector producing [`WebSocketTransport`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn SignalingTransport>> {
        Ok(Arc::new(WebSocketTransport::connect(url).await?))
    }
}
