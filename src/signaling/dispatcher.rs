use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use super::message::SignalingMessage;
use super::transport::TransportEvent;

/// Receives signaling input. Implemented by the coordinator and participant roles.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle_message(&self, message: SignalingMessage);

    async fn on_disconnected(&self) {}

    async fn on_reconnected(&self) {}
}

const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

type Workers = HashMap<String, mpsc::UnboundedSender<SignalingMessage>>;

fn lock_workers(workers: &Mutex<Workers>) -> MutexGuard<'_, Workers> {
    match workers.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Fans messages out to one worker per routing key.
///
/// Each worker applies its identity's messages strictly in receipt order;
/// different identities advance concurrently. Room-level messages are
/// handled inline. A worker left idle retires itself, so departed and
/// stray senders do not pin tasks.
pub struct OrderedDispatcher<H: MessageHandler> {
    handler: Arc<H>,
    workers: Arc<Mutex<Workers>>,
    idle_timeout: Duration,
}

impl<H: MessageHandler> OrderedDispatcher<H> {
    pub fn new(handler: Arc<H>) -> Arc<Self> {
        Self::with_idle_timeout(handler, WORKER_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(handler: Arc<H>, idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            handler,
            workers: Arc::new(Mutex::new(HashMap::new())),
            idle_timeout,
        })
    }

    pub async fn dispatch(&self, message: SignalingMessage) {
        let key = match message.routing_key() {
            Some(key) => key.to_string(),
            None => {
                self.handler.handle_message(message).await;
                return;
            }
        };

        let mut workers = lock_workers(&self.workers);

        let message = match workers.get(&key) {
            Some(worker) => match worker.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let worker = self.spawn_worker(&key);
        if worker.send(message).is_err() {
            tracing::error!(identity = %key, "Dispatch worker closed immediately");
        }
        workers.insert(key, worker);
    }

    pub fn worker_count(&self) -> usize {
        lock_workers(&self.workers).len()
    }

    /// Pumps transport events until the transport goes away.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(message) => self.dispatch(message).await,
                TransportEvent::Disconnected => self.handler.on_disconnected().await,
                TransportEvent::Reconnected => self.handler.on_reconnected().await,
            }
        }
        tracing::info!("Signaling event stream ended");
    }

    fn spawn_worker(&self, key: &str) -> mpsc::UnboundedSender<SignalingMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let handler = self.handler.clone();
        let workers = self.workers.clone();
        let idle_timeout = self.idle_timeout;
        let identity = key.to_string();

        tokio::spawn(async move {
            tracing::debug!(identity = %identity, "Dispatch worker started");
            loop {
                let message = match tokio::time::timeout(idle_timeout, rx.recv()).await {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(_) => {
                        // dispatch sends under this lock, so an empty queue stays empty
                        let mut map = lock_workers(&workers);
                        match rx.try_recv() {
                            Ok(message) => {
                                drop(map);
                                message
                            }
                            Err(_) => {
                                map.remove(&identity);
                                break;
                            }
                        }
                    }
                };
                handler.handle_message(message).await;
            }
            tracing::debug!(identity = %identity, "Dispatch worker retired");
        });

        tx
    }
}
