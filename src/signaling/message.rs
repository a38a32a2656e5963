use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Messages forwarded by the relay. Session descriptions and candidates keep
/// the browser JSON shape so browser participants interoperate unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum SignalingMessage {
    #[serde(rename = "newRoom", rename_all = "camelCase")]
    RoomCreated {
        room_name: String,
        allowed_identities: Vec<String>,
        coordinator_identity: String,
    },

    #[serde(rename = "joinRoom", rename_all = "camelCase")]
    JoinRoom { room_name: String, identity: String },

    #[serde(rename = "videoOffer", rename_all = "camelCase")]
    SessionOffer {
        from: String,
        to: String,
        offer: RTCSessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        registration_id: Option<String>,
    },

    #[serde(rename = "videoAnswer", rename_all = "camelCase")]
    SessionAnswer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        to: String,
        answer: RTCSessionDescription,
    },

    #[serde(rename = "iceCandidate", rename_all = "camelCase")]
    NetworkCandidate {
        from: String,
        to: String,
        candidate: RTCIceCandidateInit,
    },

    #[serde(rename = "message", rename_all = "camelCase")]
    ChatMessage { sender: String, text: String },
}

impl SignalingMessage {
    /// Identity whose entry this message drives. Room-level messages have none.
    pub fn routing_key(&self) -> Option<&str> {
        match self {
            SignalingMessage::SessionOffer { from, .. } => Some(from),
            SignalingMessage::SessionAnswer { from, .. } => from.as_deref(),
            SignalingMessage::NetworkCandidate { from, .. } => Some(from),
            SignalingMessage::JoinRoom { identity, .. } => Some(identity),
            SignalingMessage::RoomCreated { .. } | SignalingMessage::ChatMessage { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::RoomCreated { .. } => "RoomCreated",
            SignalingMessage::JoinRoom { .. } => "JoinRoom",
            SignalingMessage::SessionOffer { .. } => "SessionOffer",
            SignalingMessage::SessionAnswer { .. } => "SessionAnswer",
            SignalingMessage::NetworkCandidate { .. } => "NetworkCandidate",
            SignalingMessage::ChatMessage { .. } => "ChatMessage",
        }
    }
}
