//! WebSocket signaling client with fixed-delay reconnect

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{SignalingEvent, SignalingLink, SignalingMessage};
use crate::config::SignalingConfig;
use crate::error::{AppError, Result};

/// Signaling relay client
///
/// One background task owns the socket: it connects, pumps messages in
/// both directions, and after any disconnect waits the configured delay
/// before trying again, forever, until [`SignalingClient::shutdown`].
pub struct SignalingClient {
    url: String,
    outbound_tx: mpsc::UnboundedSender<String>,
    state_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Start the connection task
    ///
    /// Returns the client and the receiver of inbound events.
    pub fn spawn(config: &SignalingConfig) -> (Self, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(connection_loop(
            config.url.clone(),
            config.connect_timeout(),
            config.reconnect_delay(),
            state_tx,
            event_tx,
            outbound_rx,
            cancel.clone(),
        ));

        let client = Self {
            url: config.url.clone(),
            outbound_tx,
            state_rx,
            cancel,
            task: Mutex::new(Some(task)),
        };
        (client, event_rx)
    }

    /// Relay URL this client (re)connects to
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stop reconnecting and close the socket
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("Signaling client stopped");
    }
}

impl SignalingLink for SignalingClient {
    /// Queue a message for the relay
    ///
    /// Fails with `SignalingDisconnected` while the socket is down; the
    /// message is dropped, not queued for later.
    fn send(&self, message: &SignalingMessage) -> Result<()> {
        if !*self.state_rx.borrow() {
            debug!("Dropping {} while signaling is disconnected", message.message_type());
            return Err(AppError::SignalingDisconnected);
        }
        let json = message.to_json()?;
        self.outbound_tx
            .send(json)
            .map_err(|_| AppError::SignalingDisconnected)
    }

    fn is_connected(&self) -> bool {
        *self.state_rx.borrow()
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn connection_loop(
    url: String,
    connect_timeout: Duration,
    reconnect_delay: Duration,
    state_tx: watch::Sender<bool>,
    event_tx: mpsc::UnboundedSender<SignalingEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        info!("Connecting to signaling relay {}", url);
        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            r = tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url.as_str())) => r,
        };

        match attempt {
            Ok(Ok((ws_stream, _))) => {
                // anything queued during the race with the last disconnect is stale
                while outbound_rx.try_recv().is_ok() {}

                state_tx.send_replace(true);
                let _ = event_tx.send(SignalingEvent::Connected);
                info!("Signaling connected");

                let reason = pump(ws_stream, &mut outbound_rx, &event_tx, &cancel).await;

                state_tx.send_replace(false);
                if cancel.is_cancelled() {
                    break;
                }
                warn!("Signaling disconnected: {}", reason);
                let _ = event_tx.send(SignalingEvent::Disconnected { reason });
            }
            Ok(Err(e)) => {
                warn!("Failed to connect to signaling relay: {}", e);
            }
            Err(_) => {
                warn!("Signaling connect timed out after {:?}", connect_timeout);
            }
        }

        info!("Reconnecting to signaling relay in {:?}", reconnect_delay);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }
    state_tx.send_replace(false);
}

/// Move messages until the socket fails or the client shuts down
///
/// Returns the reason the connection ended.
async fn pump<S>(
    ws_stream: S,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    event_tx: &mpsc::UnboundedSender<SignalingEvent>,
    cancel: &CancellationToken,
) -> String
where
    S: futures::Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut ws_write, mut ws_read) = ws_stream.split();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                let _ = ws_write.send(WsMessage::Close(None)).await;
                return "shutdown".to_string();
            }

            outbound = outbound_rx.recv() => {
                let Some(json) = outbound else {
                    return "client dropped".to_string();
                };
                trace!("Signaling send: {}", json);
                if let Err(e) = ws_write.send(WsMessage::Text(json)).await {
                    return format!("write failed: {}", e);
                }
            }

            inbound = ws_read.next() => {
                let text = match inbound {
                    Some(Ok(WsMessage::Text(text))) => text.to_string(),
                    Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Discarding non-UTF-8 binary signaling frame");
                            continue;
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) => return "closed by relay".to_string(),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return format!("read failed: {}", e),
                    None => return "stream ended".to_string(),
                };

                match SignalingMessage::from_json(&text) {
                    Ok(message) => {
                        trace!("Signaling recv: {}", message.message_type());
                        let _ = event_tx.send(SignalingEvent::Message(message));
                    }
                    Err(e) => warn!("Discarding unparseable signaling message: {}", e),
                }
            }
        }
    }
}
