use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::message::SignalingMessage;
use crate::error::{ProctorError, Result};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// What the transport reports upward. Connection Entries are never touched here.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(SignalingMessage),
    Disconnected,
    Reconnected,
}

/// Outbound half of the signaling channel.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, message: SignalingMessage) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self);
}

/// Relay connection over a WebSocket carrying JSON text frames.
///
/// The connection task owns the socket. If the relay drops the connection the
/// task reconnects with exponential backoff and reports `Reconnected`, so the
/// layers above can re-signal whatever sessions they still want.
pub struct WebSocketTransport {
    endpoint: String,
    outbound: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    pub async fn connect(
        endpoint: &str,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let (stream, _) = connect_async(endpoint).await.map_err(|e| {
            ProctorError::transport(format!("Failed to connect to relay {}: {}", endpoint, e))
        })?;

        tracing::info!(endpoint = %endpoint, "Connected to signaling relay");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(run_connection(
            endpoint.to_string(),
            stream,
            outbound_rx,
            events_tx,
            connected.clone(),
            shutdown_rx,
        ));

        let transport = Arc::new(Self {
            endpoint: endpoint.to_string(),
            outbound: outbound_tx,
            connected,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        });

        Ok((transport, events_rx))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn send(&self, message: SignalingMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(ProctorError::transport(format!(
                "Relay {} not connected, dropping {}",
                self.endpoint,
                message.kind()
            )));
        }

        let text = serde_json::to_string(&message)?;
        self.outbound
            .send(text)
            .map_err(|_| ProctorError::transport("Relay connection task has stopped"))?;

        tracing::debug!(kind = message.kind(), "Queued signaling message");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        self.connected.store(false, Ordering::SeqCst);
        tracing::info!(endpoint = %self.endpoint, "Disconnected from signaling relay");
    }
}

async fn run_connection(
    endpoint: String,
    initial: WsStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut stream = Some(initial);
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let ws = match stream.take() {
            Some(ws) => ws,
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => return,
                }

                match connect_async(endpoint.as_str()).await {
                    Ok((ws, _)) => {
                        backoff = INITIAL_BACKOFF;
                        connected.store(true, Ordering::SeqCst);
                        tracing::info!(endpoint = %endpoint, "Reconnected to signaling relay");
                        let _ = events.send(TransportEvent::Reconnected);
                        ws
                    }
                    Err(e) => {
                        tracing::warn!(
                            endpoint = %endpoint,
                            error = %e,
                            retry_in_ms = backoff.as_millis() as u64,
                            "Relay reconnect failed"
                        );
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                        continue;
                    }
                }
            }
        };

        let (mut sink, mut source) = ws.split();

        let stopped = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break true;
                }
                out = outbound.recv() => match out {
                    Some(text) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            tracing::warn!(error = %e, "Failed to write to relay");
                            break false;
                        }
                    }
                    None => break true,
                },
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SignalingMessage>(&text) {
                            Ok(message) => {
                                if events.send(TransportEvent::Message(message)).is_err() {
                                    break true;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    error = %e,
                                    raw_message = %text,
                                    "Failed to parse signaling message"
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break false,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Relay connection error");
                        break false;
                    }
                },
            }
        };

        connected.store(false, Ordering::SeqCst);
        if stopped {
            return;
        }

        tracing::warn!(endpoint = %endpoint, "Lost connection to signaling relay");
        if events.send(TransportEvent::Disconnected).is_err() {
            return;
        }
    }
}
