// Connection registry and offer/answer/candidate state machine

mod common;

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

use common::*;
use screen_proctor::error::ProctorError;
use screen_proctor::config::IceConfig;
use screen_proctor::session::{
    ConnectionRegistry, NegotiationPhase, NegotiationRole, RtcSessionFactory, SessionEvent,
    Transition,
};
use screen_proctor::signaling::{MessageHandler, OrderedDispatcher, SignalingMessage};

fn connected(identity: &str) -> SessionEvent {
    SessionEvent::StateChanged {
        identity: identity.to_string(),
        state: RTCPeerConnectionState::Connected,
    }
}

#[tokio::test]
async fn test_candidates_before_offer_applied_in_receipt_order() {
    let transport = FakeTransport::new();
    let factory = FakeSessionFactory::new();
    let registry = answerer_registry(transport.clone(), factory.clone());

    for (i, name) in ["c1", "c2", "c3"].iter().enumerate() {
        let transition = registry.handle_candidate("UNI001", candidate(name)).await.unwrap();
        assert_eq!(transition, Transition::Buffered { pending: i + 1 });
    }
    assert!(factory.candidates_applied("UNI001").is_empty());

    let transition = registry
        .handle_offer("UNI001", offer(), Some("UNI001".to_string()))
        .await
        .unwrap();
    assert_eq!(transition, Transition::Applied(NegotiationPhase::HaveLocalAnswer));

    assert_eq!(
        factory.ops(),
        vec![
            Op::RemoteDescription("UNI001".into(), RTCSdpType::Offer),
            Op::Candidate("UNI001".into(), "c1".into()),
            Op::Candidate("UNI001".into(), "c2".into()),
            Op::Candidate("UNI001".into(), "c3".into()),
            Op::LocalDescription("UNI001".into(), RTCSdpType::Answer),
        ]
    );

    let answers = transport.sent_of_kind("SessionAnswer");
    assert_eq!(answers.len(), 1);
    match &answers[0] {
        SignalingMessage::SessionAnswer { from, to, .. } => {
            assert_eq!(from.as_deref(), Some(COORDINATOR));
            assert_eq!(to, "UNI001");
        }
        other => panic!("unexpected message {:?}", other),
    }

    registry.apply_session_event(connected("UNI001")).await;
    assert_eq!(registry.phase("UNI001").await, Some(NegotiationPhase::Connected));

    let snapshot = registry.snapshot("UNI001").await.unwrap();
    assert_eq!(snapshot.pending_candidates, 0);
    assert_eq!(factory.created(), 1);
}

#[tokio::test]
async fn test_offer_then_candidates_through_dispatcher_stay_ordered() {
    let transport = FakeTransport::new();
    let factory = FakeSessionFactory::new();
    let registry = answerer_registry(transport.clone(), factory.clone());

    let handler = Arc::new(RegistryHandler {
        registry: registry.clone(),
    });
    let dispatcher = OrderedDispatcher::new(handler);

    dispatcher
        .dispatch(SignalingMessage::SessionOffer {
            from: "UNI001".into(),
            to: COORDINATOR.into(),
            offer: offer(),
            registration_id: Some("UNI001".into()),
        })
        .await;
    for name in ["c1", "c2", "c3"] {
        dispatcher
            .dispatch(SignalingMessage::NetworkCandidate {
                from: "UNI001".into(),
                to: COORDINATOR.into(),
                candidate: candidate(name),
            })
            .await;
    }

    let polled = factory.clone();
    assert!(eventually(move || {
        let polled = polled.clone();
        async move { polled.candidates_applied("UNI001").len() == 3 }
    })
    .await);

    assert_eq!(factory.candidates_applied("UNI001"), vec!["c1", "c2", "c3"]);
    let ops = factory.ops();
    let answer_at = ops
        .iter()
        .position(|op| matches!(op, Op::LocalDescription(_, RTCSdpType::Answer)))
        .unwrap();
    let first_candidate = ops
        .iter()
        .position(|op| matches!(op, Op::Candidate(..)))
        .unwrap();
    assert!(answer_at < first_candidate);
    assert_eq!(dispatcher.worker_count(), 1);
}

struct RegistryHandler {
    registry: Arc<ConnectionRegistry>,
}

#[async_trait]
impl MessageHandler for RegistryHandler {
    async fn handle_message(&self, message: SignalingMessage) {
        match message {
            SignalingMessage::SessionOffer {
                from,
                offer,
                registration_id,
                ..
            } => {
                self.registry.handle_offer(&from, offer, registration_id).await.unwrap();
            }
            SignalingMessage::NetworkCandidate {
                from, candidate, ..
            } => {
                self.registry.handle_candidate(&from, candidate).await.unwrap();
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_failing_buffered_candidate_is_skipped() {
    let transport = FakeTransport::new();
    let factory = FakeSessionFactory::with_failing_candidates(&["c2"]);
    let registry = answerer_registry(transport, factory.clone());

    for name in ["c1", "c2", "c3"] {
        registry.handle_candidate("UNI002", candidate(name)).await.unwrap();
    }
    registry.handle_offer("UNI002", offer(), None).await.unwrap();

    assert_eq!(factory.candidates_applied("UNI002"), vec!["c1", "c3"]);
    assert_eq!(
        registry.phase("UNI002").await,
        Some(NegotiationPhase::HaveLocalAnswer)
    );
}

#[tokio::test]
async fn test_candidate_after_remote_description_applied_immediately() {
    let transport = FakeTransport::new();
    let factory = FakeSessionFactory::new();
    let registry = answerer_registry(transport, factory.clone());

    registry.handle_offer("UNI003", offer(), None).await.unwrap();
    let transition = registry.handle_candidate("UNI003", candidate("c9")).await.unwrap();

    assert_eq!(transition, Transition::Applied(NegotiationPhase::HaveLocalAnswer));
    assert_eq!(factory.candidates_applied("UNI003"), vec!["c9"]);
}

#[tokio::test]
async fn test_concurrent_create_or_get_yields_one_session() {
    let transport = FakeTransport::new();
    let factory = FakeSessionFactory::with_create_delay(Duration::from_millis(50));
    let registry = answerer_registry(transport, factory.clone());

    let (a, b) = tokio::join!(
        registry.create_or_get("UNI004"),
        registry.create_or_get("UNI004")
    );

    assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    assert_eq!(factory.created(), 1);
    assert_eq!(registry.len().await, 1);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let transport = FakeTransport::new();
    let factory = FakeSessionFactory::new();
    let registry = answerer_registry(transport, factory.clone());

    registry.handle_offer("UNI005", offer(), None).await.unwrap();

    assert!(registry.close("UNI005").await);
    assert!(!registry.close("UNI005").await);

    assert_eq!(factory.closed(), 1);
    assert!(registry.is_empty().await);
    assert!(registry.phase("UNI005").await.is_none());
}

#[tokio::test]
async fn test_candidates_never_create_sessions() {
    let transport = FakeTransport::new();
    let factory = FakeSessionFactory::new();
    let registry = answerer_registry(transport, factory.clone());

    let stray = registry.handle_candidate("stranger", candidate("s1")).await.unwrap();
    assert_eq!(stray, Transition::Buffered { pending: 1 });
    assert!(registry.phase("stranger").await.is_none());

    registry.handle_offer("UNI001", offer(), None).await.unwrap();
    assert!(registry.close("UNI001").await);

    registry.handle_candidate("UNI001", candidate("late")).await.unwrap();

    assert_eq!(factory.created(), 1);
    assert!(registry.phase("UNI001").await.is_none());
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_failed_answer_discards_entry_so_reoffer_starts_clean() {
    let transport = FakeTransport::new();
    let factory = FakeSessionFactory::with_failing_answers(1);
    let registry = answerer_registry(transport.clone(), factory.clone());

    registry.handle_candidate("UNI011", candidate("c1")).await.unwrap();
    let err = registry
        .handle_offer("UNI011", offer(), Some("UNI011".to_string()))
        .await
        .unwrap_err();

    assert!(matches!(err, ProctorError::Negotiation { .. }));
    assert!(registry.phase("UNI011").await.is_none());
    assert_eq!(factory.closed(), 1);
    assert!(transport.sent_of_kind("SessionAnswer").is_empty());

    let retry = registry
        .handle_offer("UNI011", offer(), Some("UNI011".to_string()))
        .await
        .unwrap();

    assert_eq!(retry, Transition::Applied(NegotiationPhase::HaveLocalAnswer));
    assert_eq!(factory.created(), 2);
    assert_eq!(transport.sent_of_kind("SessionAnswer").len(), 1);
}

#[tokio::test]
async fn test_duplicate_offer_is_ignored() {
    let transport = FakeTransport::new();
    let factory = FakeSessionFactory::new();
    let registry = answerer_registry(transport.clone(), factory.clone());

    registry.handle_offer("UNI006", offer(), None).await.unwrap();
    let transition = registry.handle_offer("UNI006", offer(), None).await.unwrap();

    assert_eq!(transition, Transition::Ignored(NegotiationPhase::HaveLocalAnswer));
    assert_eq!(transport.sent_of_kind("SessionAnswer").len(), 1);
    assert_eq!(factory.created(), 1);
}

#[tokio::test]
async fn test_registration_id_labels_entry() {
    let transport = FakeTransport::new();
    let factory = FakeSessionFactory::new();
    let registry = answerer_registry(transport, factory);

    registry
        .handle_offer("sock-7", offer(), Some("UNI007".to_string()))
        .await
        .unwrap();
    registry.handle_offer("sock-8", offer(), None).await.unwrap();

    let snapshots = registry.snapshots().await;
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].registration_id.as_deref(), Some("UNI007"));
    assert_eq!(snapshots[1].registration_id, None);
}

#[tokio::test]
async fn test_local_candidate_addressed_to_counterpart() {
    let transport = FakeTransport::new();
    let factory = FakeSessionFactory::new();
    let registry = answerer_registry(transport.clone(), factory.clone());

    registry.handle_offer("UNI008", offer(), None).await.unwrap();
    factory.emit(
        "UNI008",
        SessionEvent::LocalCandidate {
            identity: "UNI008".to_string(),
            candidate: candidate("local-1"),
        },
    );

    let polled = transport.clone();
    assert!(eventually(move || {
        let polled = polled.clone();
        async move { !polled.sent_of_kind("NetworkCandidate").is_empty() }
    })
    .await);

    match &transport.sent_of_kind("NetworkCandidate")[0] {
        SignalingMessage::NetworkCandidate {
            from,
            to,
            candidate,
        } => {
            assert_eq!(from, COORDINATOR);
            assert_eq!(to, "UNI008");
            assert_eq!(candidate.candidate, "local-1");
        }
        other => panic!("unexpected message {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_connection_closes_entry() {
    let transport = FakeTransport::new();
    let factory = FakeSessionFactory::new();
    let registry = answerer_registry(transport, factory.clone());

    registry.handle_offer("UNI009", offer(), None).await.unwrap();
    registry
        .apply_session_event(SessionEvent::StateChanged {
            identity: "UNI009".to_string(),
            state: RTCPeerConnectionState::Failed,
        })
        .await;

    assert!(registry.phase("UNI009").await.is_none());
    assert_eq!(factory.closed(), 1);
}

#[tokio::test]
async fn test_disconnected_state_keeps_entry() {
    let transport = FakeTransport::new();
    let factory = FakeSessionFactory::new();
    let registry = answerer_registry(transport, factory.clone());

    registry.handle_offer("UNI010", offer(), None).await.unwrap();
    registry.apply_session_event(connected("UNI010")).await;
    registry
        .apply_session_event(SessionEvent::StateChanged {
            identity: "UNI010".to_string(),
            state: RTCPeerConnectionState::Disconnected,
        })
        .await;

    assert_eq!(registry.phase("UNI010").await, Some(NegotiationPhase::Connected));
    assert_eq!(factory.closed(), 0);
}

#[tokio::test]
async fn test_close_unconnected_keeps_live_sessions() {
    let transport = FakeTransport::new();
    let factory = FakeSessionFactory::new();
    let registry = answerer_registry(transport, factory.clone());

    registry.handle_offer("live", offer(), None).await.unwrap();
    registry.apply_session_event(connected("live")).await;
    registry.handle_offer("stalled", offer(), None).await.unwrap();
    registry.handle_candidate("pending", candidate("c1")).await.unwrap();

    let discarded = registry.close_unconnected().await;

    assert_eq!(discarded, vec!["stalled"]);
    assert_eq!(registry.phase("live").await, Some(NegotiationPhase::Connected));
    assert_eq!(registry.len().await, 1);

    // Held candidates from before the sweep do not leak into a fresh negotiation
    registry.handle_offer("pending", offer(), None).await.unwrap();
    assert!(factory.candidates_applied("pending").is_empty());
}

#[tokio::test]
async fn test_close_all_tears_everything_down() {
    let transport = FakeTransport::new();
    let factory = FakeSessionFactory::new();
    let registry = answerer_registry(transport, factory.clone());

    for identity in ["a", "b", "c"] {
        registry.handle_offer(identity, offer(), None).await.unwrap();
    }

    assert_eq!(registry.close_all().await, 3);

    let polled = registry.clone();
    assert!(eventually(move || {
        let polled = polled.clone();
        async move { polled.is_empty().await }
    })
    .await);
    let polled = factory.clone();
    assert!(eventually(move || {
        let polled = polled.clone();
        async move { polled.closed() == 3 }
    })
    .await);
}

// Offerer side

fn offerer_registry(
    transport: Arc<FakeTransport>,
    factory: Arc<FakeSessionFactory>,
) -> Arc<ConnectionRegistry> {
    ConnectionRegistry::new("sock-42", NegotiationRole::Offerer, factory, transport)
}

#[tokio::test]
async fn test_offer_answer_then_duplicate_answer_ignored() {
    let transport = FakeTransport::new();
    let factory = FakeSessionFactory::new();
    let registry = offerer_registry(transport.clone(), factory.clone());

    let transition = registry
        .start_offer(COORDINATOR, Some("UNI042".to_string()))
        .await
        .unwrap();
    assert_eq!(transition, Transition::Applied(NegotiationPhase::HaveLocalOffer));

    match &transport.sent_of_kind("SessionOffer")[0] {
        SignalingMessage::SessionOffer {
            from,
            to,
            registration_id,
            ..
        } => {
            assert_eq!(from, "sock-42");
            assert_eq!(to, COORDINATOR);
            assert_eq!(registration_id.as_deref(), Some("UNI042"));
        }
        other => panic!("unexpected message {:?}", other),
    }

    // Candidates from the coordinator can beat its answer
    let early = registry.handle_candidate(COORDINATOR, candidate("t1")).await.unwrap();
    assert_eq!(early, Transition::Buffered { pending: 1 });

    let applied = registry.handle_answer(COORDINATOR, answer()).await.unwrap();
    assert_eq!(applied, Transition::Applied(NegotiationPhase::HaveRemoteAnswer));
    assert_eq!(factory.candidates_applied(COORDINATOR), vec!["t1"]);

    registry.apply_session_event(connected(COORDINATOR)).await;
    assert_eq!(registry.phase(COORDINATOR).await, Some(NegotiationPhase::Connected));

    let duplicate = registry.handle_answer(COORDINATOR, answer()).await.unwrap();
    assert_eq!(duplicate, Transition::Ignored(NegotiationPhase::Connected));
    assert_eq!(registry.phase(COORDINATOR).await, Some(NegotiationPhase::Connected));

    let remote_applies = factory
        .ops()
        .into_iter()
        .filter(|op| matches!(op, Op::RemoteDescription(..)))
        .count();
    assert_eq!(remote_applies, 1);
}

#[tokio::test]
async fn test_answer_for_unknown_identity_creates_nothing() {
    let transport = FakeTransport::new();
    let factory = FakeSessionFactory::new();
    let registry = offerer_registry(transport, factory.clone());

    let transition = registry.handle_answer("nobody", answer()).await.unwrap();
    assert_eq!(transition, Transition::NoEntry);
    assert!(registry.is_empty().await);
    assert_eq!(factory.created(), 0);
}

#[tokio::test]
async fn test_answerer_cannot_originate_offers() {
    let transport = FakeTransport::new();
    let factory = FakeSessionFactory::new();
    let registry = answerer_registry(transport, factory);

    let err = registry.start_offer("UNI001", None).await.unwrap_err();
    assert!(matches!(err, ProctorError::Negotiation { .. }));
}

#[tokio::test]
async fn test_offer_without_capture_track_is_media_acquisition_error() {
    let transport = FakeTransport::new();
    let factory = Arc::new(RtcSessionFactory::new(&IceConfig::default()).unwrap());
    let registry = ConnectionRegistry::new("sock-1", NegotiationRole::Offerer, factory, transport.clone());

    let err = registry.start_offer(COORDINATOR, None).await.unwrap_err();
    assert!(matches!(err, ProctorError::MediaAcquisition(_)));
    assert!(registry.is_empty().await);
    assert!(transport.sent().is_empty());
}

// Dispatcher ordering across identities

struct OrderLog {
    seen: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl MessageHandler for OrderLog {
    async fn handle_message(&self, message: SignalingMessage) {
        if let SignalingMessage::NetworkCandidate { from, candidate, .. } = message {
            // Earlier messages sleep longer; ordering must still hold per identity
            let delay = 30u64.saturating_sub(candidate.candidate.len() as u64 * 5);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.seen.lock().unwrap().push((from, candidate.candidate));
        }
    }
}

#[tokio::test]
async fn test_dispatcher_preserves_per_identity_order() {
    let handler = Arc::new(OrderLog {
        seen: Mutex::new(Vec::new()),
    });
    let dispatcher = OrderedDispatcher::new(handler.clone());

    for identity in ["x", "y"] {
        for name in ["a", "bb", "ccc", "dddd"] {
            dispatcher
                .dispatch(SignalingMessage::NetworkCandidate {
                    from: identity.to_string(),
                    to: COORDINATOR.to_string(),
                    candidate: candidate(name),
                })
                .await;
        }
    }

    let polled = handler.clone();
    assert!(eventually(move || {
        let polled = polled.clone();
        async move { polled.seen.lock().unwrap().len() == 8 }
    })
    .await);

    let seen = handler.seen.lock().unwrap().clone();
    for identity in ["x", "y"] {
        let order: Vec<&str> = seen
            .iter()
            .filter(|(from, _)| from == identity)
            .map(|(_, c)| c.as_str())
            .collect();
        assert_eq!(order, vec!["a", "bb", "ccc", "dddd"]);
    }
    assert_eq!(dispatcher.worker_count(), 2);
}

#[tokio::test]
async fn test_idle_dispatch_workers_retire_and_restart_in_order() {
    let handler = Arc::new(OrderLog {
        seen: Mutex::new(Vec::new()),
    });
    let dispatcher = OrderedDispatcher::with_idle_timeout(handler.clone(), Duration::from_millis(50));

    let send = |name: &'static str| SignalingMessage::NetworkCandidate {
        from: "x".to_string(),
        to: COORDINATOR.to_string(),
        candidate: candidate(name),
    };

    dispatcher.dispatch(send("a")).await;
    assert_eq!(dispatcher.worker_count(), 1);

    let polled = dispatcher.clone();
    assert!(eventually(move || {
        let polled = polled.clone();
        async move { polled.worker_count() == 0 }
    })
    .await);

    dispatcher.dispatch(send("bb")).await;
    dispatcher.dispatch(send("ccc")).await;

    let polled = handler.clone();
    assert!(eventually(move || {
        let polled = polled.clone();
        async move { polled.seen.lock().unwrap().len() == 3 }
    })
    .await);

    let order: Vec<String> = handler
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|(_, c)| c.clone())
        .collect();
    assert_eq!(order, vec!["a", "bb", "ccc"]);
}
