// Shared in-process fakes for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use warp::Filter;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use screen_proctor::error::{ProctorError, Result};
use screen_proctor::recording::{
    CaptureSettings, ChunkEncoder, EncoderFactory, QualityTier, RecordingManager,
};
use screen_proctor::session::{
    ConnectionRegistry, InboundStream, MediaTrack, NegotiationRole, PeerSession, SessionEvent,
    SessionEventSender, SessionFactory,
};
use screen_proctor::signaling::{SignalingMessage, SignalingTransport};

pub const COORDINATOR: &str = "teacher-1";

pub fn description(sdp_type: RTCSdpType, sdp: &str) -> RTCSessionDescription {
    let mut description = RTCSessionDescription::default();
    description.sdp_type = sdp_type;
    description.sdp = sdp.to_string();
    description
}

pub fn offer() -> RTCSessionDescription {
    description(RTCSdpType::Offer, "v=0\r\no=- offer\r\n")
}

pub fn answer() -> RTCSessionDescription {
    description(RTCSdpType::Answer, "v=0\r\no=- answer\r\n")
}

pub fn candidate(name: &str) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: name.to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ---------------------------------------------------------------------------
// Transport

#[derive(Default)]
pub struct FakeTransport {
    sent: Mutex<Vec<SignalingMessage>>,
    disconnected: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_of_kind(&self, kind: &str) -> Vec<SignalingMessage> {
        self.sent()
            .into_iter()
            .filter(|message| message.kind() == kind)
            .collect()
    }

    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingTransport for FakeTransport {
    async fn send(&self, message: SignalingMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(ProctorError::transport("fake relay offline"));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.set_connected(false);
    }
}

// ---------------------------------------------------------------------------
// Sessions

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    RemoteDescription(String, RTCSdpType),
    LocalDescription(String, RTCSdpType),
    Candidate(String, String),
    Close(String),
}

#[derive(Default)]
pub struct FakeSessionFactory {
    log: Arc<Mutex<Vec<Op>>>,
    created: AtomicUsize,
    closed: Arc<AtomicUsize>,
    create_delay: Option<Duration>,
    failing_candidates: HashSet<String>,
    failing_answers: Arc<AtomicUsize>,
    events: Mutex<HashMap<String, SessionEventSender>>,
}

impl FakeSessionFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_create_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            create_delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn with_failing_candidates(names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            failing_candidates: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        })
    }

    /// The next `count` answers created by any session fail.
    pub fn with_failing_answers(count: usize) -> Arc<Self> {
        Arc::new(Self {
            failing_answers: Arc::new(AtomicUsize::new(count)),
            ..Default::default()
        })
    }

    pub fn ops(&self) -> Vec<Op> {
        self.log.lock().unwrap().clone()
    }

    pub fn candidates_applied(&self, identity: &str) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Candidate(id, name) if id == identity => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Emits a callback event as the real session would.
    pub fn emit(&self, identity: &str, event: SessionEvent) {
        if let Some(events) = self.events.lock().unwrap().get(identity) {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl SessionFactory for FakeSessionFactory {
    async fn create(
        &self,
        identity: &str,
        _role: NegotiationRole,
        events: SessionEventSender,
    ) -> Result<Arc<dyn PeerSession>> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        self.events
            .lock()
            .unwrap()
            .insert(identity.to_string(), events);

        Ok(Arc::new(FakePeerSession {
            identity: identity.to_string(),
            log: self.log.clone(),
            closed: self.closed.clone(),
            failing_candidates: self.failing_candidates.clone(),
            failing_answers: self.failing_answers.clone(),
        }))
    }
}

pub struct FakePeerSession {
    identity: String,
    log: Arc<Mutex<Vec<Op>>>,
    closed: Arc<AtomicUsize>,
    failing_candidates: HashSet<String>,
    failing_answers: Arc<AtomicUsize>,
}

#[async_trait]
impl PeerSession for FakePeerSession {
    async fn apply_remote_description(&self, description: RTCSessionDescription) -> Result<()> {
        tokio::task::yield_now().await;
        self.log.lock().unwrap().push(Op::RemoteDescription(
            self.identity.clone(),
            description.sdp_type,
        ));
        Ok(())
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription> {
        Ok(offer())
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription> {
        tokio::task::yield_now().await;
        let failing = self
            .failing_answers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProctorError::negotiation(
                self.identity.clone(),
                "answer creation failed",
            ));
        }
        Ok(answer())
    }

    async fn apply_local_description(&self, description: RTCSessionDescription) -> Result<()> {
        self.log.lock().unwrap().push(Op::LocalDescription(
            self.identity.clone(),
            description.sdp_type,
        ));
        Ok(())
    }

    async fn add_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        if self.failing_candidates.contains(&candidate.candidate) {
            return Err(ProctorError::negotiation(
                self.identity.clone(),
                format!("malformed candidate {}", candidate.candidate),
            ));
        }
        self.log
            .lock()
            .unwrap()
            .push(Op::Candidate(self.identity.clone(), candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(Op::Close(self.identity.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Media

/// Track fed by the test; dropping the sender ends the stream.
pub struct FakeTrack {
    id: String,
    packets: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl FakeTrack {
    pub fn stream(id: &str) -> (InboundStream, mpsc::UnboundedSender<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let track = Arc::new(FakeTrack {
            id: id.to_string(),
            packets: tokio::sync::Mutex::new(rx),
        });
        (InboundStream::new(track), tx)
    }
}

#[async_trait]
impl MediaTrack for FakeTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn read_packet(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.packets.lock().await.recv().await)
    }
}

/// Encoder that passes RTP bytes straight through as chunk data.
#[derive(Default)]
pub struct PassthroughEncoderFactory {
    failing: HashSet<String>,
    flush_delay: Option<Duration>,
}

impl PassthroughEncoderFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_for(identities: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            failing: identities.iter().map(|i| i.to_string()).collect(),
            ..Default::default()
        })
    }

    /// Encoders whose `finish` blocks for `delay` before returning the tail.
    pub fn with_flush_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            flush_delay: Some(delay),
            ..Default::default()
        })
    }
}

impl EncoderFactory for PassthroughEncoderFactory {
    fn create(&self, identity: &str, _bitrate_bps: u32) -> Result<Box<dyn ChunkEncoder>> {
        if self.failing.contains(identity) {
            return Err(ProctorError::recording(identity, "encoder unavailable"));
        }
        Ok(Box::new(PassthroughEncoder {
            pending: Vec::new(),
            flush_delay: self.flush_delay,
        }))
    }
}

pub struct PassthroughEncoder {
    pending: Vec<u8>,
    flush_delay: Option<Duration>,
}

impl ChunkEncoder for PassthroughEncoder {
    fn push_rtp(&mut self, packet: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(packet);
        Ok(())
    }

    fn pull_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        Ok(Some(std::mem::take(&mut self.pending)))
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>> {
        if let Some(delay) = self.flush_delay {
            std::thread::sleep(delay);
        }
        Ok(self.pending)
    }
}

// ---------------------------------------------------------------------------
// Assembly

pub fn answerer_registry(
    transport: Arc<FakeTransport>,
    factory: Arc<FakeSessionFactory>,
) -> Arc<ConnectionRegistry> {
    let registry = ConnectionRegistry::new(
        COORDINATOR,
        NegotiationRole::Answerer,
        factory,
        transport,
    );
    registry.start_event_processing();
    registry
}

pub fn test_settings() -> CaptureSettings {
    CaptureSettings {
        chunk_interval: Duration::from_millis(20),
        flush_timeout: Duration::from_secs(1),
        tier: QualityTier::Standard,
    }
}

pub fn recorder(
    registry: Arc<ConnectionRegistry>,
    encoders: Arc<PassthroughEncoderFactory>,
) -> Arc<RecordingManager> {
    recorder_with(registry, encoders, test_settings())
}

pub fn recorder_with(
    registry: Arc<ConnectionRegistry>,
    encoders: Arc<PassthroughEncoderFactory>,
    settings: CaptureSettings,
) -> Arc<RecordingManager> {
    Arc::new(RecordingManager::new(registry, encoders, settings))
}

/// Negotiates `identity` to an attached stream and returns the packet feed.
pub async fn attach(
    registry: &Arc<ConnectionRegistry>,
    identity: &str,
    registration_id: &str,
) -> mpsc::UnboundedSender<Vec<u8>> {
    registry
        .handle_offer(identity, offer(), Some(registration_id.to_string()))
        .await
        .unwrap();

    let (stream, feed) = FakeTrack::stream(&format!("{}-screen", identity));
    registry
        .apply_session_event(SessionEvent::Track {
            identity: identity.to_string(),
            stream,
        })
        .await;
    feed
}

// ---------------------------------------------------------------------------
// Relay

/// In-process relay: every text frame goes to every other client. Sending on
/// the returned channel drops all current connections.
pub async fn spawn_relay() -> (SocketAddr, broadcast::Sender<()>) {
    type Clients = Arc<Mutex<HashMap<usize, mpsc::UnboundedSender<warp::ws::Message>>>>;

    let clients: Clients = Arc::new(Mutex::new(HashMap::new()));
    let next_id = Arc::new(AtomicUsize::new(0));
    let (kick_tx, _) = broadcast::channel::<()>(4);

    let kick = kick_tx.clone();
    let route = warp::path("ws").and(warp::ws()).map(move |ws: warp::ws::Ws| {
        let clients = clients.clone();
        let id = next_id.fetch_add(1, Ordering::SeqCst);
        let mut kick = kick.subscribe();

        ws.on_upgrade(move |socket| async move {
            let (mut sink, mut source) = socket.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel();
            clients.lock().unwrap().insert(id, out_tx);

            loop {
                tokio::select! {
                    _ = kick.recv() => {
                        let _ = sink.send(warp::ws::Message::close()).await;
                        break;
                    }
                    Some(message) = out_rx.recv() => {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    incoming = source.next() => match incoming {
                        Some(Ok(message)) if message.is_text() => {
                            for (other, client) in clients.lock().unwrap().iter() {
                                if *other != id {
                                    let _ = client.send(message.clone());
                                }
                            }
                        }
                        Some(Ok(message)) if message.is_close() => break,
                        Some(Ok(_)) => {}
                        _ => break,
                    },
                }
            }

            clients.lock().unwrap().remove(&id);
        })
    });

    let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    (addr, kick_tx)
}
