use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{ProctorError, Result};
use crate::session::{ConnectionRegistry, ConnectionSnapshot, Transition};
use crate::signaling::{MessageHandler, SignalingMessage, SignalingTransport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinedRoom {
    pub room_name: String,
    pub coordinator: String,
}

/// The observed side: joins a room it is listed in and offers one screen
/// stream to the coordinator.
pub struct Participant {
    registration_id: String,
    transport: Arc<dyn SignalingTransport>,
    registry: Arc<ConnectionRegistry>,
    joined: RwLock<Option<JoinedRoom>>,
}

impl Participant {
    pub fn new(
        registration_id: impl Into<String>,
        transport: Arc<dyn SignalingTransport>,
        registry: Arc<ConnectionRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registration_id: registration_id.into(),
            transport,
            registry,
            joined: RwLock::new(None),
        })
    }

    pub fn registration_id(&self) -> &str {
        &self.registration_id
    }

    pub async fn joined_room(&self) -> Option<JoinedRoom> {
        self.joined.read().await.clone()
    }

    /// Asks to join a room by name. The coordinator answers with a room
    /// announcement once admitted.
    pub async fn request_join(&self, room_name: &str) -> Result<()> {
        self.transport
            .send(SignalingMessage::JoinRoom {
                room_name: room_name.to_string(),
                identity: self.registration_id.clone(),
            })
            .await
    }

    /// Offers the local capture track to the room's coordinator.
    pub async fn share_screen(&self) -> Result<Transition> {
        let joined = self.joined_room().await.ok_or(ProctorError::NoRoom)?;

        self.registry
            .start_offer(&joined.coordinator, Some(self.registration_id.clone()))
            .await
    }

    pub async fn stop_sharing(&self) -> bool {
        match self.joined_room().await {
            Some(joined) => self.registry.close(&joined.coordinator).await,
            None => false,
        }
    }

    pub async fn connection(&self) -> Option<ConnectionSnapshot> {
        let joined = self.joined_room().await?;
        self.registry.snapshot(&joined.coordinator).await
    }

    async fn on_room_created(
        &self,
        room_name: String,
        allowed_identities: Vec<String>,
        coordinator_identity: String,
    ) {
        if !allowed_identities.contains(&self.registration_id) {
            tracing::debug!(room_name = %room_name, "Not listed in announced room");
            return;
        }

        let joined = JoinedRoom {
            room_name: room_name.clone(),
            coordinator: coordinator_identity,
        };

        {
            let mut current = self.joined.write().await;
            if current.as_ref() == Some(&joined) {
                return;
            }
            *current = Some(joined);
        }

        match self.request_join(&room_name).await {
            Ok(()) => tracing::info!(room_name = %room_name, "Joined room"),
            Err(e) => tracing::warn!(room_name = %room_name, error = %e, "Failed to join room"),
        }
    }

    async fn is_from_coordinator(&self, from: &str) -> bool {
        match self.joined.read().await.as_ref() {
            Some(joined) => joined.coordinator == from,
            None => false,
        }
    }
}

#[async_trait]
impl MessageHandler for Participant {
    async fn handle_message(&self, message: SignalingMessage) {
        match message {
            SignalingMessage::RoomCreated {
                room_name,
                allowed_identities,
                coordinator_identity,
            } => {
                self.on_room_created(room_name, allowed_identities, coordinator_identity)
                    .await
            }
            SignalingMessage::SessionAnswer { from, to, answer } => {
                if to != self.registry.local_identity() {
                    return;
                }
                let coordinator = match from {
                    Some(from) => from,
                    None => match self.joined_room().await {
                        Some(joined) => joined.coordinator,
                        None => {
                            tracing::warn!("Answer before joining a room ignored");
                            return;
                        }
                    },
                };
                match self.registry.handle_answer(&coordinator, answer).await {
                    Ok(transition) => {
                        tracing::debug!(transition = ?transition, "Answer handled")
                    }
                    Err(e) => tracing::warn!(error = %e, "Answer failed"),
                }
            }
            SignalingMessage::NetworkCandidate {
                from,
                to,
                candidate,
            } => {
                if to != self.registry.local_identity() {
                    return;
                }
                if !self.is_from_coordinator(&from).await {
                    tracing::debug!(from = %from, "Candidate from unknown sender ignored");
                    return;
                }
                if let Err(e) = self.registry.handle_candidate(&from, candidate).await {
                    tracing::warn!(error = %e, "Candidate failed");
                }
            }
            SignalingMessage::ChatMessage { sender, text } => {
                tracing::info!(sender = %sender, text = %text, "Chat message");
            }
            SignalingMessage::JoinRoom { .. } | SignalingMessage::SessionOffer { .. } => {}
        }
    }

    async fn on_reconnected(&self) {
        if let Some(joined) = self.joined_room().await {
            if let Err(e) = self.request_join(&joined.room_name).await {
                tracing::warn!(error = %e, "Failed to rejoin room after reconnect");
            }
        }
    }
}
