use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use super::peer::PeerSession;
use super::stream::InboundStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationRole {
    /// Participant side: one outbound session
    Offerer,
    /// Coordinator side: many inbound sessions
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationPhase {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalAnswer,
    HaveRemoteAnswer,
    Connected,
    Closed,
}

impl NegotiationPhase {
    /// Phases from which a connected peer-connection state is accepted.
    pub fn awaiting_connectivity(self) -> bool {
        matches!(
            self,
            NegotiationPhase::HaveLocalAnswer | NegotiationPhase::HaveRemoteAnswer
        )
    }
}

impl fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationPhase::New => "new",
            NegotiationPhase::HaveLocalOffer => "have-local-offer",
            NegotiationPhase::HaveRemoteOffer => "have-remote-offer",
            NegotiationPhase::HaveLocalAnswer => "have-local-answer",
            NegotiationPhase::HaveRemoteAnswer => "have-remote-answer",
            NegotiationPhase::Connected => "connected",
            NegotiationPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Outcome of feeding one input to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied(NegotiationPhase),
    Buffered { pending: usize },
    Ignored(NegotiationPhase),
    /// No entry exists for the identity and the input does not create one.
    NoEntry,
}

/// Per-participant negotiation record. Only the registry mutates it.
pub struct ConnectionEntry {
    identity: String,
    registration_id: Option<String>,
    role: NegotiationRole,
    phase: NegotiationPhase,
    session: Arc<dyn PeerSession>,
    remote_description_applied: bool,
    pending_candidates: VecDeque<RTCIceCandidateInit>,
    stream: Option<InboundStream>,
}

impl ConnectionEntry {
    pub(super) fn new(identity: String, role: NegotiationRole, session: Arc<dyn PeerSession>) -> Self {
        Self {
            identity,
            registration_id: None,
            role,
            phase: NegotiationPhase::New,
            session,
            remote_description_applied: false,
            pending_candidates: VecDeque::new(),
            stream: None,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    /// Human-readable name for exports; the identity until a registration id arrives.
    pub fn label(&self) -> &str {
        self.registration_id.as_deref().unwrap_or(&self.identity)
    }

    pub(super) fn session(&self) -> Arc<dyn PeerSession> {
        self.session.clone()
    }

    pub(super) fn set_phase(&mut self, phase: NegotiationPhase) {
        tracing::debug!(
            identity = %self.identity,
            from = %self.phase,
            to = %phase,
            "Negotiation phase transition"
        );
        self.phase = phase;
    }

    pub(super) fn set_registration_id(&mut self, registration_id: String) {
        self.registration_id = Some(registration_id);
    }

    pub(super) fn mark_remote_description_applied(&mut self) {
        self.remote_description_applied = true;
    }

    pub(super) fn accepts_candidates(&self) -> bool {
        self.remote_description_applied
    }

    pub(super) fn buffer_candidate(&mut self, candidate: RTCIceCandidateInit) -> usize {
        self.pending_candidates.push_back(candidate);
        self.pending_candidates.len()
    }

    /// Pending candidates in receipt order, leaving the buffer empty.
    pub(super) fn take_pending(&mut self) -> VecDeque<RTCIceCandidateInit> {
        std::mem::take(&mut self.pending_candidates)
    }

    pub(super) fn attach_stream(&mut self, stream: InboundStream) {
        self.stream = Some(stream);
    }

    pub(super) fn detach_stream(&mut self) -> Option<InboundStream> {
        self.stream.take()
    }

    pub fn stream(&self) -> Option<&InboundStream> {
        self.stream.as_ref()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            identity: self.identity.clone(),
            registration_id: self.registration_id.clone(),
            role: self.role,
            phase: self.phase,
            pending_candidates: self.pending_candidates.len(),
            has_stream: self.stream.is_some(),
        }
    }
}

/// Read-only view handed to presentation code.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub identity: String,
    pub registration_id: Option<String>,
    pub role: NegotiationRole,
    pub phase: NegotiationPhase,
    pub pending_candidates: usize,
    pub has_stream: bool,
}
