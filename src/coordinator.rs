use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{ProctorError, Result};
use crate::export::{Archive, ArchiveExporter};
use crate::recording::{BulkOutcome, RecordingManager, RecordingSnapshot};
use crate::session::{ConnectionRegistry, ConnectionSnapshot, Room};
use crate::signaling::{MessageHandler, SignalingMessage, SignalingTransport};

#[derive(Debug, Clone, Serialize)]
pub struct ChatEntry {
    pub sender: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub identity: String,
    pub transport_connected: bool,
    pub room: Option<Room>,
    pub connections: Vec<ConnectionSnapshot>,
    pub recordings: Vec<RecordingSnapshot>,
}

/// The observing side of a room: answers every participant's offer,
/// records their screens and bundles the recordings.
pub struct Coordinator {
    identity: String,
    transport: Arc<dyn SignalingTransport>,
    registry: Arc<ConnectionRegistry>,
    recorder: Arc<RecordingManager>,
    exporter: ArchiveExporter,
    output_dir: PathBuf,
    room: RwLock<Option<Room>>,
    chat: RwLock<Vec<ChatEntry>>,
}

impl Coordinator {
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        registry: Arc<ConnectionRegistry>,
        recorder: Arc<RecordingManager>,
        output_dir: impl Into<PathBuf>,
    ) -> Arc<Self> {
        let exporter = ArchiveExporter::new(recorder.container_extension());

        Arc::new(Self {
            identity: registry.local_identity().to_string(),
            transport,
            registry,
            recorder,
            exporter,
            output_dir: output_dir.into(),
            room: RwLock::new(None),
            chat: RwLock::new(Vec::new()),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn recorder(&self) -> &Arc<RecordingManager> {
        &self.recorder
    }

    /// Opens the room and announces it to eligible participants.
    pub async fn open_room(&self, name: Option<String>, roster: Vec<String>) -> Result<String> {
        let room_name = {
            let mut room = self.room.write().await;
            if let Some(existing) = room.as_ref() {
                return Err(ProctorError::internal(format!(
                    "Room {} is already open",
                    existing.name
                )));
            }
            let opened = Room::new(name, self.identity.clone(), roster);
            let room_name = opened.name.clone();
            *room = Some(opened);
            room_name
        };

        self.announce_room().await?;
        Ok(room_name)
    }

    async fn announce_room(&self) -> Result<()> {
        let message = {
            let room = self.room.read().await;
            let room = room.as_ref().ok_or(ProctorError::NoRoom)?;
            SignalingMessage::RoomCreated {
                room_name: room.name.clone(),
                allowed_identities: room.allowed_identities(),
                coordinator_identity: self.identity.clone(),
            }
        };

        self.transport.send(message).await?;
        tracing::info!(coordinator = %self.identity, "Room announced");
        Ok(())
    }

    pub async fn room(&self) -> Option<Room> {
        self.room.read().await.clone()
    }

    /// Stops every recording, tears every connection down and forgets the room.
    /// Recordings stay available for export.
    pub async fn close_room(&self) -> Result<usize> {
        let room = self.room.write().await.take().ok_or(ProctorError::NoRoom)?;

        let stopped = self.recorder.stop_all().await;
        let closing = self.registry.close_all().await;

        tracing::info!(
            room_name = %room.name,
            recordings_stopped = stopped.succeeded.len(),
            connections_closing = closing,
            "Room closed"
        );
        Ok(closing)
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.transport
            .send(SignalingMessage::ChatMessage {
                sender: self.identity.clone(),
                text: text.clone(),
            })
            .await?;
        self.record_chat(self.identity.clone(), text).await;
        Ok(())
    }

    async fn record_chat(&self, sender: String, text: String) {
        self.chat.write().await.push(ChatEntry {
            sender,
            text,
            received_at: Utc::now(),
        });
    }

    pub async fn chat_log(&self) -> Vec<ChatEntry> {
        self.chat.read().await.clone()
    }

    pub async fn start_recording(&self, identity: &str) -> Result<()> {
        self.recorder.start(identity).await
    }

    pub async fn start_all_recordings(&self) -> BulkOutcome {
        self.recorder.start_all().await
    }

    pub async fn stop_recording(&self, identity: &str) -> Result<()> {
        self.recorder.stop(identity).await.map(|_| ())
    }

    pub async fn stop_all_recordings(&self) -> BulkOutcome {
        self.recorder.stop_all().await
    }

    /// Bundles every finished recording.
    pub async fn export(&self) -> Result<Archive> {
        let sessions = self.recorder.lock_sessions().await;
        self.exporter.export(sessions.iter().map(|session| &**session))
    }

    /// Stop everything, export and save the archive to the output directory.
    pub async fn finish_recording(&self) -> Result<(Archive, PathBuf)> {
        self.recorder.stop_all().await;
        let archive = self.export().await?;
        let path = self.exporter.save(&archive, &self.output_dir)?;
        Ok((archive, path))
    }

    pub async fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            identity: self.identity.clone(),
            transport_connected: self.transport.is_connected(),
            room: self.room().await,
            connections: self.registry.snapshots().await,
            recordings: self.recorder.snapshots().await,
        }
    }

    fn addressed_to_me(&self, to: &str, kind: &str) -> bool {
        if to != self.identity {
            tracing::debug!(to = %to, kind = %kind, "Ignoring message addressed elsewhere");
            return false;
        }
        true
    }

    async fn on_join(&self, room_name: String, identity: String) {
        let admitted = {
            let mut room = self.room.write().await;
            match room.as_mut() {
                Some(room) if room.name == room_name => room.admit(&identity),
                Some(_) => {
                    tracing::warn!(room_name = %room_name, identity = %identity, "Join for another room");
                    false
                }
                None => {
                    tracing::warn!(identity = %identity, "Join while no room is open");
                    false
                }
            }
        };

        // Late joiners learn the coordinator identity from the announcement
        if admitted {
            if let Err(e) = self.announce_room().await {
                tracing::warn!(error = %e, "Failed to re-announce room");
            }
        }
    }

    async fn on_offer(
        &self,
        from: String,
        offer: RTCSessionDescription,
        registration_id: Option<String>,
    ) {
        {
            let room = self.room.read().await;
            let Some(room) = room.as_ref() else {
                tracing::warn!(identity = %from, error = %ProctorError::NoRoom, "Rejected offer");
                return;
            };
            let Some(registration_id) = registration_id.as_deref() else {
                let err = ProctorError::negotiation(&from, "offer without registration id");
                tracing::warn!(identity = %from, error = %err, "Rejected offer");
                return;
            };
            if !room.is_allowed(registration_id) {
                let err = ProctorError::NotAllowed(registration_id.to_string());
                tracing::warn!(identity = %from, error = %err, "Rejected offer");
                return;
            }
        }

        match self.registry.handle_offer(&from, offer, registration_id).await {
            Ok(transition) => {
                tracing::debug!(identity = %from, transition = ?transition, "Offer handled");
            }
            Err(e) => tracing::warn!(identity = %from, error = %e, "Offer failed"),
        }
    }
}

#[async_trait]
impl MessageHandler for Coordinator {
    async fn handle_message(&self, message: SignalingMessage) {
        tracing::debug!(kind = %message.kind(), "Coordinator received message");

        match message {
            SignalingMessage::RoomCreated { .. } => {}
            SignalingMessage::JoinRoom {
                room_name,
                identity,
            } => self.on_join(room_name, identity).await,
            SignalingMessage::SessionOffer {
                from,
                to,
                offer,
                registration_id,
            } => {
                if self.addressed_to_me(&to, "SessionOffer") {
                    self.on_offer(from, offer, registration_id).await;
                }
            }
            SignalingMessage::SessionAnswer { from, to, answer } => {
                if !self.addressed_to_me(&to, "SessionAnswer") {
                    return;
                }
                let Some(from) = from else {
                    tracing::warn!("Answer without sender ignored");
                    return;
                };
                if let Err(e) = self.registry.handle_answer(&from, answer).await {
                    tracing::warn!(identity = %from, error = %e, "Answer failed");
                }
            }
            SignalingMessage::NetworkCandidate {
                from,
                to,
                candidate,
            } => {
                if !self.addressed_to_me(&to, "NetworkCandidate") {
                    return;
                }
                if let Err(e) = self.registry.handle_candidate(&from, candidate).await {
                    tracing::warn!(identity = %from, error = %e, "Candidate failed");
                }
            }
            SignalingMessage::ChatMessage { sender, text } => {
                tracing::info!(sender = %sender, "Chat message");
                self.record_chat(sender, text).await;
            }
        }
    }

    async fn on_disconnected(&self) {
        tracing::warn!("Signaling relay lost, connections keep running");
    }

    async fn on_reconnected(&self) {
        if self.room.read().await.is_none() {
            return;
        }

        let discarded = self.registry.close_unconnected().await;
        if !discarded.is_empty() {
            tracing::info!(
                count = discarded.len(),
                "Discarded unfinished negotiations for re-offer"
            );
        }

        if let Err(e) = self.announce_room().await {
            tracing::warn!(error = %e, "Failed to re-announce room after reconnect");
        }
    }
}
