use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex, MutexGuard, RwLock};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::entry::{ConnectionEntry, ConnectionSnapshot, NegotiationPhase, NegotiationRole, Transition};
use super::peer::{SessionEvent, SessionEventSender, SessionFactory};
use super::stream::InboundStream;
use crate::error::{ProctorError, Result};
use crate::signaling::{SignalingMessage, SignalingTransport};

/// Candidates kept per identity that has no entry yet.
const UNCLAIMED_CANDIDATE_LIMIT: usize = 32;

/// Owns one Connection Entry per participant identity and drives the
/// offer/answer/candidate state machine for each of them.
///
/// `create_or_get` is the only place entries come into existence; closing
/// is the only way they leave. Candidates that arrive before any entry
/// exists wait in a registry-level buffer and move into the entry when an
/// offer creates it. Every transition for one identity runs
/// under that entry's lock, so inputs for the same identity apply in the
/// order they were handed in, while different identities never block each
/// other beyond the map lookup.
pub struct ConnectionRegistry {
    local_identity: String,
    role: NegotiationRole,
    factory: Arc<dyn SessionFactory>,
    transport: Arc<dyn SignalingTransport>,
    entries: RwLock<HashMap<String, Arc<Mutex<ConnectionEntry>>>>,
    unclaimed: Mutex<HashMap<String, VecDeque<RTCIceCandidateInit>>>,
    events_tx: SessionEventSender,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
}

impl ConnectionRegistry {
    pub fn new(
        local_identity: impl Into<String>,
        role: NegotiationRole,
        factory: Arc<dyn SessionFactory>,
        transport: Arc<dyn SignalingTransport>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            local_identity: local_identity.into(),
            role,
            factory,
            transport,
            entries: RwLock::new(HashMap::new()),
            unclaimed: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    pub fn local_identity(&self) -> &str {
        &self.local_identity
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    /// Applies session callbacks (local candidates, state changes, tracks)
    /// as they arrive. Call once after construction.
    pub fn start_event_processing(self: &Arc<Self>) {
        let registry: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let receiver = match registry.upgrade() {
                Some(registry) => registry.events_rx.lock().await.take(),
                None => None,
            };

            let Some(mut rx) = receiver else {
                return;
            };

            while let Some(event) = rx.recv().await {
                match registry.upgrade() {
                    Some(registry) => registry.apply_session_event(event).await,
                    None => break,
                }
            }
        });
    }

    /// Returns the entry for `identity`, creating it (and its real-time
    /// session) in phase `new` if absent. Concurrent calls for one identity
    /// yield the same entry and exactly one session.
    pub async fn create_or_get(&self, identity: &str) -> Result<Arc<Mutex<ConnectionEntry>>> {
        if let Some(entry) = self.entries.read().await.get(identity) {
            return Ok(entry.clone());
        }

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(identity) {
            return Ok(entry.clone());
        }

        let session = self
            .factory
            .create(identity, self.role, self.events_tx.clone())
            .await?;

        let mut entry = ConnectionEntry::new(identity.to_string(), self.role, session);
        let early = self.unclaimed.lock().await.remove(identity).unwrap_or_default();
        let claimed = early.len();
        for candidate in early {
            entry.buffer_candidate(candidate);
        }

        let entry = Arc::new(Mutex::new(entry));
        entries.insert(identity.to_string(), entry.clone());

        tracing::info!(
            identity = %identity,
            role = ?self.role,
            early_candidates = claimed,
            "Created connection entry"
        );
        Ok(entry)
    }

    pub async fn get(&self, identity: &str) -> Option<Arc<Mutex<ConnectionEntry>>> {
        self.entries.read().await.get(identity).cloned()
    }

    /// Answerer side: apply a remote offer, answer it, send the answer back.
    pub async fn handle_offer(
        &self,
        identity: &str,
        offer: RTCSessionDescription,
        registration_id: Option<String>,
    ) -> Result<Transition> {
        let slot = self.create_or_get(identity).await?;
        let mut entry = slot.lock().await;

        if self.role != NegotiationRole::Answerer || entry.phase() != NegotiationPhase::New {
            tracing::warn!(
                identity = %identity,
                phase = %entry.phase(),
                "Ignoring offer for entry already past new"
            );
            return Ok(Transition::Ignored(entry.phase()));
        }

        if let Some(registration_id) = registration_id {
            entry.set_registration_id(registration_id);
        }

        let answer = match self.answer_offer(&mut entry, offer).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(
                    identity = %identity,
                    phase = %entry.phase(),
                    error = %e,
                    "Offer failed, discarding entry"
                );
                self.discard(identity, &slot, entry).await;
                return Err(e);
            }
        };

        tracing::info!(identity = %identity, "Answered session offer");

        self.transport
            .send(SignalingMessage::SessionAnswer {
                from: Some(self.local_identity.clone()),
                to: identity.to_string(),
                answer,
            })
            .await?;

        Ok(Transition::Applied(NegotiationPhase::HaveLocalAnswer))
    }

    async fn answer_offer(
        &self,
        entry: &mut ConnectionEntry,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription> {
        let session = entry.session();
        session.apply_remote_description(offer).await?;
        entry.mark_remote_description_applied();
        entry.set_phase(NegotiationPhase::HaveRemoteOffer);
        self.drain_pending(entry).await;

        let answer = session.create_answer().await?;
        session.apply_local_description(answer.clone()).await?;
        entry.set_phase(NegotiationPhase::HaveLocalAnswer);
        Ok(answer)
    }

    /// Offerer side: create and send a local offer to `identity`.
    pub async fn start_offer(
        &self,
        identity: &str,
        registration_id: Option<String>,
    ) -> Result<Transition> {
        if self.role != NegotiationRole::Offerer {
            return Err(ProctorError::negotiation(
                identity,
                "answerer registry cannot originate offers",
            ));
        }

        let slot = self.create_or_get(identity).await?;
        let mut entry = slot.lock().await;

        if entry.phase() != NegotiationPhase::New {
            tracing::warn!(
                identity = %identity,
                phase = %entry.phase(),
                "Offer already in flight"
            );
            return Ok(Transition::Ignored(entry.phase()));
        }

        let session = entry.session();
        let offer = session.create_offer().await?;
        session.apply_local_description(offer.clone()).await?;
        entry.set_phase(NegotiationPhase::HaveLocalOffer);

        self.transport
            .send(SignalingMessage::SessionOffer {
                from: self.local_identity.clone(),
                to: identity.to_string(),
                offer,
                registration_id,
            })
            .await?;

        tracing::info!(identity = %identity, "Sent session offer");
        Ok(Transition::Applied(NegotiationPhase::HaveLocalOffer))
    }

    /// Offerer side: apply the counterpart's answer. Stale or duplicate
    /// answers are ignored.
    pub async fn handle_answer(
        &self,
        identity: &str,
        answer: RTCSessionDescription,
    ) -> Result<Transition> {
        let Some(slot) = self.get(identity).await else {
            tracing::warn!(identity = %identity, "Ignoring answer for unknown entry");
            return Ok(Transition::NoEntry);
        };
        let mut entry = slot.lock().await;

        if entry.phase() != NegotiationPhase::HaveLocalOffer {
            tracing::warn!(
                identity = %identity,
                phase = %entry.phase(),
                "Ignoring answer outside have-local-offer"
            );
            return Ok(Transition::Ignored(entry.phase()));
        }

        let session = entry.session();
        session.apply_remote_description(answer).await?;
        entry.mark_remote_description_applied();
        entry.set_phase(NegotiationPhase::HaveRemoteAnswer);
        self.drain_pending(&mut entry).await;

        tracing::info!(identity = %identity, "Applied session answer");
        Ok(Transition::Applied(NegotiationPhase::HaveRemoteAnswer))
    }

    /// Applies a remote candidate, or buffers it until the entry has a
    /// remote description. Candidates never create an entry: without one
    /// they wait, bounded, for the offer that does.
    pub async fn handle_candidate(
        &self,
        identity: &str,
        candidate: RTCIceCandidateInit,
    ) -> Result<Transition> {
        let slot = {
            let entries = self.entries.read().await;
            match entries.get(identity) {
                Some(slot) => slot.clone(),
                None => {
                    let mut unclaimed = self.unclaimed.lock().await;
                    let queue = unclaimed.entry(identity.to_string()).or_default();
                    if queue.len() >= UNCLAIMED_CANDIDATE_LIMIT {
                        tracing::warn!(
                            identity = %identity,
                            limit = UNCLAIMED_CANDIDATE_LIMIT,
                            "Dropping candidate for identity without entry"
                        );
                        return Ok(Transition::NoEntry);
                    }
                    queue.push_back(candidate);
                    tracing::debug!(
                        identity = %identity,
                        queue_size = queue.len(),
                        "Held candidate until an offer creates the entry"
                    );
                    return Ok(Transition::Buffered {
                        pending: queue.len(),
                    });
                }
            }
        };
        let mut entry = slot.lock().await;

        if entry.phase() == NegotiationPhase::Closed {
            return Ok(Transition::Ignored(NegotiationPhase::Closed));
        }

        if !entry.accepts_candidates() {
            let pending = entry.buffer_candidate(candidate);
            tracing::debug!(
                identity = %identity,
                queue_size = pending,
                "Buffered candidate until remote description is applied"
            );
            return Ok(Transition::Buffered { pending });
        }

        entry.session().add_candidate(candidate).await?;
        tracing::debug!(identity = %identity, "Applied remote candidate");
        Ok(Transition::Applied(entry.phase()))
    }

    /// Applies buffered candidates in receipt order. A failing candidate is
    /// skipped; the rest still apply.
    async fn drain_pending(&self, entry: &mut ConnectionEntry) {
        let pending = entry.take_pending();
        if pending.is_empty() {
            return;
        }

        tracing::info!(
            identity = %entry.identity(),
            count = pending.len(),
            "Draining buffered candidates"
        );

        let session = entry.session();
        for (index, candidate) in pending.into_iter().enumerate() {
            if let Err(e) = session.add_candidate(candidate).await {
                tracing::warn!(
                    identity = %entry.identity(),
                    index = index,
                    error = %e,
                    "Skipping buffered candidate that failed to apply"
                );
            }
        }
    }

    pub async fn apply_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::LocalCandidate { identity, candidate } => {
                let message = SignalingMessage::NetworkCandidate {
                    from: self.local_identity.clone(),
                    to: identity.clone(),
                    candidate,
                };
                if let Err(e) = self.transport.send(message).await {
                    tracing::warn!(identity = %identity, error = %e, "Failed to send local candidate");
                }
            }
            SessionEvent::StateChanged { identity, state } => match state {
                RTCPeerConnectionState::Connected => {
                    let Some(slot) = self.get(&identity).await else {
                        return;
                    };
                    let mut entry = slot.lock().await;
                    if entry.phase().awaiting_connectivity() {
                        entry.set_phase(NegotiationPhase::Connected);
                        tracing::info!(identity = %identity, "Connection established");
                    } else {
                        tracing::debug!(
                            identity = %identity,
                            phase = %entry.phase(),
                            "Connected state outside answer phase, phase unchanged"
                        );
                    }
                }
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                    tracing::info!(identity = %identity, state = %state, "Participant departed");
                    self.close(&identity).await;
                }
                RTCPeerConnectionState::Disconnected => {
                    tracing::warn!(identity = %identity, "Peer connection interrupted");
                }
                _ => {}
            },
            SessionEvent::Track { identity, stream } => {
                let Some(slot) = self.get(&identity).await else {
                    tracing::warn!(identity = %identity, "Track for unknown entry dropped");
                    return;
                };
                let mut entry = slot.lock().await;
                tracing::info!(identity = %identity, stream_id = %stream.id, "Attached inbound stream");
                entry.attach_stream(stream);
            }
        }
    }

    /// Releases the entry's session and media handles and forgets it.
    /// Returns `false` when there was nothing left to close.
    pub async fn close(&self, identity: &str) -> bool {
        let slot = self.entries.write().await.remove(identity);

        let Some(slot) = slot else {
            tracing::debug!(identity = %identity, "Entry already closed");
            return false;
        };

        let entry = slot.lock().await;
        self.teardown(identity, entry).await;
        true
    }

    /// Closes `slot` while its lock is held, provided it is still the entry
    /// registered for `identity`.
    async fn discard(
        &self,
        identity: &str,
        slot: &Arc<Mutex<ConnectionEntry>>,
        entry: MutexGuard<'_, ConnectionEntry>,
    ) -> bool {
        {
            let mut entries = self.entries.write().await;
            match entries.get(identity) {
                Some(current) if Arc::ptr_eq(current, slot) => {
                    entries.remove(identity);
                }
                _ => return false,
            }
        }

        self.teardown(identity, entry).await;
        true
    }

    async fn teardown(&self, identity: &str, mut entry: MutexGuard<'_, ConnectionEntry>) {
        entry.detach_stream();
        entry.take_pending();
        entry.set_phase(NegotiationPhase::Closed);
        let session = entry.session();
        drop(entry);

        if let Err(e) = session.close().await {
            tracing::warn!(identity = %identity, error = %e, "Error while closing session");
        }

        tracing::info!(identity = %identity, "Closed connection entry");
    }

    /// Fire-and-forget teardown of every entry. Returns how many were scheduled.
    pub async fn close_all(self: &Arc<Self>) -> usize {
        self.unclaimed.lock().await.clear();
        let identities: Vec<String> = self.entries.read().await.keys().cloned().collect();

        for identity in &identities {
            let registry = self.clone();
            let identity = identity.clone();
            tokio::spawn(async move {
                registry.close(&identity).await;
            });
        }

        identities.len()
    }

    /// Closes every entry that never reached `connected`, so the
    /// counterpart can negotiate again from scratch. The phase is checked
    /// and the entry removed under one hold of its lock.
    pub async fn close_unconnected(&self) -> Vec<String> {
        self.unclaimed.lock().await.clear();

        let mut discarded = Vec::new();
        for (identity, slot) in self.entry_list().await {
            let entry = slot.lock().await;
            if entry.phase() == NegotiationPhase::Connected {
                continue;
            }
            if self.discard(&identity, &slot, entry).await {
                discarded.push(identity);
            }
        }
        discarded
    }

    pub async fn phase(&self, identity: &str) -> Option<NegotiationPhase> {
        let slot = self.get(identity).await?;
        let phase = slot.lock().await.phase();
        Some(phase)
    }

    pub async fn snapshot(&self, identity: &str) -> Option<ConnectionSnapshot> {
        let slot = self.get(identity).await?;
        let snapshot = slot.lock().await.snapshot();
        Some(snapshot)
    }

    pub async fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        let mut snapshots = Vec::new();
        for (_, slot) in self.entry_list().await {
            snapshots.push(slot.lock().await.snapshot());
        }
        snapshots.sort_by(|a, b| a.identity.cmp(&b.identity));
        snapshots
    }

    /// Stream and export label for one identity, if media is flowing.
    pub async fn attached_stream(&self, identity: &str) -> Option<(InboundStream, String)> {
        let slot = self.get(identity).await?;
        let entry = slot.lock().await;
        let stream = entry.stream()?.clone();
        Some((stream, entry.label().to_string()))
    }

    /// `(identity, label, stream)` for every entry with attached media.
    pub async fn attached_streams(&self) -> Vec<(String, String, InboundStream)> {
        let mut streams = Vec::new();
        for (identity, slot) in self.entry_list().await {
            let entry = slot.lock().await;
            if let Some(stream) = entry.stream() {
                streams.push((identity, entry.label().to_string(), stream.clone()));
            }
        }
        streams.sort_by(|a, b| a.0.cmp(&b.0));
        streams
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn entry_list(&self) -> Vec<(String, Arc<Mutex<ConnectionEntry>>)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
