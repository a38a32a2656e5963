use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

use super::entry::NegotiationRole;
use super::stream::{InboundStream, RtpTrack};
use super::rtc_api;
use crate::config::IceConfig;
use crate::error::{ProctorError, Result};

/// Callback output of a real-time session, funnelled into the registry.
#[derive(Debug)]
pub enum SessionEvent {
    LocalCandidate {
        identity: String,
        candidate: RTCIceCandidateInit,
    },
    StateChanged {
        identity: String,
        state: RTCPeerConnectionState,
    },
    Track {
        identity: String,
        stream: InboundStream,
    },
}

pub type SessionEventSender = mpsc::UnboundedSender<SessionEvent>;

/// One real-time media session with a single counterpart.
#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn apply_remote_description(&self, description: RTCSessionDescription) -> Result<()>;

    async fn create_offer(&self) -> Result<RTCSessionDescription>;

    async fn create_answer(&self) -> Result<RTCSessionDescription>;

    async fn apply_local_description(&self, description: RTCSessionDescription) -> Result<()>;

    async fn add_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Builds sessions and wires their callbacks to `events`.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(
        &self,
        identity: &str,
        role: NegotiationRole,
        events: SessionEventSender,
    ) -> Result<Arc<dyn PeerSession>>;
}

pub struct RtcSessionFactory {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
    local_tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl RtcSessionFactory {
    pub fn new(config: &IceConfig) -> Result<Self> {
        Ok(Self {
            api: rtc_api::build_api()?,
            ice_servers: rtc_api::ice_servers(config),
            local_tracks: Vec::new(),
        })
    }

    /// Outbound capture track sent by the offerer side.
    pub fn with_local_track(mut self, track: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        self.local_tracks.push(track);
        self
    }
}

#[async_trait]
impl SessionFactory for RtcSessionFactory {
    async fn create(
        &self,
        identity: &str,
        role: NegotiationRole,
        events: SessionEventSender,
    ) -> Result<Arc<dyn PeerSession>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let peer_connection = Arc::new(self.api.new_peer_connection(config).await?);

        if role == NegotiationRole::Offerer {
            if self.local_tracks.is_empty() {
                let _ = peer_connection.close().await;
                return Err(ProctorError::MediaAcquisition(
                    "No local capture track attached".to_string(),
                ));
            }

            for track in &self.local_tracks {
                let sender = peer_connection.add_track(track.clone()).await?;

                // RTCP has to be read for the interceptors to run
                tokio::spawn(async move {
                    let mut rtcp_buf = vec![0u8; 1500];
                    while sender.read(&mut rtcp_buf).await.is_ok() {}
                });
            }
        }

        {
            let events = events.clone();
            let identity = identity.to_string();
            peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                let identity = identity.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        tracing::debug!(identity = %identity, "Local candidate gathering complete");
                        return;
                    };
                    match candidate.to_json() {
                        Ok(candidate) => {
                            let _ = events.send(SessionEvent::LocalCandidate { identity, candidate });
                        }
                        Err(e) => {
                            tracing::warn!(identity = %identity, error = %e, "Failed to encode local candidate");
                        }
                    }
                })
            }));
        }

        {
            let events = events.clone();
            let identity = identity.to_string();
            peer_connection.on_peer_connection_state_change(Box::new(move |state| {
                tracing::info!(identity = %identity, state = %state, "Peer connection state changed");
                let _ = events.send(SessionEvent::StateChanged {
                    identity: identity.clone(),
                    state,
                });
                Box::pin(async {})
            }));
        }

        {
            let identity = identity.to_string();
            peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
                if track.kind() == RTPCodecType::Video {
                    tracing::info!(
                        identity = %identity,
                        track_id = %track.id(),
                        "Inbound screen track"
                    );
                    let stream = InboundStream::new(Arc::new(RtpTrack::new(track)));
                    let _ = events.send(SessionEvent::Track {
                        identity: identity.clone(),
                        stream,
                    });
                } else {
                    tracing::debug!(identity = %identity, kind = %track.kind(), "Ignoring non-video track");
                }
                Box::pin(async {})
            }));
        }

        Ok(Arc::new(RtcPeerSession {
            identity: identity.to_string(),
            peer_connection,
        }))
    }
}

pub struct RtcPeerSession {
    identity: String,
    peer_connection: Arc<RTCPeerConnection>,
}

impl RtcPeerSession {
    fn negotiation_error(&self, err: impl std::fmt::Display) -> ProctorError {
        ProctorError::negotiation(self.identity.clone(), err.to_string())
    }
}

#[async_trait]
impl PeerSession for RtcPeerSession {
    async fn apply_remote_description(&self, description: RTCSessionDescription) -> Result<()> {
        // Re-parse: descriptions off the wire carry only type + sdp text
        let parsed = match description.sdp_type {
            RTCSdpType::Offer => RTCSessionDescription::offer(description.sdp),
            RTCSdpType::Answer => RTCSessionDescription::answer(description.sdp),
            RTCSdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
            other => {
                return Err(self.negotiation_error(format!(
                    "unsupported remote description type {}",
                    other
                )))
            }
        }
        .map_err(|e| self.negotiation_error(e))?;

        self.peer_connection
            .set_remote_description(parsed)
            .await
            .map_err(|e| self.negotiation_error(e))
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription> {
        self.peer_connection
            .create_offer(None)
            .await
            .map_err(|e| self.negotiation_error(e))
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription> {
        self.peer_connection
            .create_answer(None)
            .await
            .map_err(|e| self.negotiation_error(e))
    }

    async fn apply_local_description(&self, description: RTCSessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(description)
            .await
            .map_err(|e| self.negotiation_error(e))
    }

    async fn add_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| self.negotiation_error(e))
    }

    async fn close(&self) -> Result<()> {
        tracing::info!(identity = %self.identity, "Closing peer connection");
        self.peer_connection.close().await?;
        Ok(())
    }
}
