use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use murmur_common::EventBus;
use murmur_config::NegotiationConfig;

use super::*;
use crate::loopback::{ice_ufrag, ChannelTransport, LoopbackConnection};
use crate::protocol::stream_keys;

const QUIET: Duration = Duration::from_millis(50);

struct Peer {
    name: String,
    handle: EngineHandle,
    connection: Arc<LoopbackConnection>,
    outbox: mpsc::UnboundedReceiver<Envelope>,
    events: broadcast::Receiver<VoiceEvent>,
    state: watch::Receiver<VoiceStateSnapshot>,
    task: JoinHandle<()>,
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn config() -> NegotiationConfig {
    NegotiationConfig {
        ice_restart_backoff_ms: 1,
        ice_restart_max_backoff_ms: 4,
        ..NegotiationConfig::default()
    }
}

fn peer(name: &str, config: NegotiationConfig) -> Peer {
    let (connection, connection_events) = LoopbackConnection::open();
    let (transport, outbox) = ChannelTransport::new();
    let (state, state_rx) = watch::channel(VoiceStateSnapshot::default());
    let bus = EventBus::new(64);
    let events = bus.subscribe();
    let engine = NegotiationEngine::new(EngineContext {
        user_id: name.to_string(),
        config,
        connection: connection.clone(),
        transport: Arc::new(transport),
        events: bus,
        state: Arc::new(state),
    });
    let (handle, task) = engine.spawn(connection_events, 64);
    Peer {
        name: name.to_string(),
        handle,
        connection,
        outbox,
        events,
        state: state_rx,
        task,
    }
}

/// Everything `peer` sends until it has been quiet for a moment.
async fn drain(peer: &mut Peer) -> Vec<VoiceSignal> {
    let mut out = Vec::new();
    while let Ok(Some(envelope)) = timeout(QUIET, peer.outbox.recv()).await {
        if let Envelope::VoiceDispatch { payload, .. } = envelope {
            out.push(payload);
        }
    }
    out
}

async fn deliver(to: &Peer, from: &str, signals: &[VoiceSignal]) {
    for signal in signals {
        to.handle.signal(from, signal.clone()).await.unwrap();
    }
}

/// Shuttle signals both ways until neither side has anything to say.
async fn settle(a: &mut Peer, b: &mut Peer) -> (Vec<VoiceSignal>, Vec<VoiceSignal>) {
    let (mut from_a, mut from_b) = (Vec::new(), Vec::new());
    loop {
        let batch_a = drain(a).await;
        let batch_b = drain(b).await;
        if batch_a.is_empty() && batch_b.is_empty() {
            return (from_a, from_b);
        }
        deliver(b, &a.name, &batch_a).await;
        deliver(a, &b.name, &batch_b).await;
        from_a.extend(batch_a);
        from_b.extend(batch_b);
    }
}

/// Two engines that have completed their first exchanges.
async fn connected_pair() -> (Peer, Peer) {
    connect(peer("alice", config()), peer("bob", config())).await
}

async fn connect(mut a: Peer, mut b: Peer) -> (Peer, Peer) {
    a.handle.peer_joined(&b.name).await.unwrap();
    settle(&mut a, &mut b).await;
    (a, b)
}

/// Attach a microphone on both sides and deliver the two offers crosswise.
/// Returns what each side sent in response.
async fn cross_offers(a: &mut Peer, b: &mut Peer) -> (Vec<VoiceSignal>, Vec<VoiceSignal>) {
    for side in [&*a, &*b] {
        side.handle
            .attach(stream_keys::USER, MediaKind::Audio, mic())
            .await
            .unwrap();
    }
    let a_out = drain(a).await;
    let b_out = drain(b).await;
    assert_eq!(offers(&a_out).len(), 1);
    assert_eq!(offers(&b_out).len(), 1);

    deliver(b, &a.name, &a_out).await;
    deliver(a, &b.name, &b_out).await;
    (drain(a).await, drain(b).await)
}

fn offers(signals: &[VoiceSignal]) -> Vec<(String, Vec<TrackInfo>)> {
    signals
        .iter()
        .filter_map(|s| match s {
            VoiceSignal::Offer { sdp, tracks } => Some((sdp.clone(), tracks.clone())),
            _ => None,
        })
        .collect()
}

fn answers(signals: &[VoiceSignal]) -> usize {
    signals
        .iter()
        .filter(|s| matches!(s, VoiceSignal::Answer { .. }))
        .count()
}

fn mic() -> LocalTrack {
    LocalTrack::new(MediaKind::Audio, "mic")
}

#[tokio::test]
async fn spawn_reserves_standard_slots() {
    let alice = peer("alice", config());
    let snapshot = alice.handle.inspect().await.unwrap();
    assert_eq!(snapshot.transceivers, 5);
    assert_eq!(snapshot.state, NegotiationState::Idle);
    assert_eq!(alice.connection.transceiver_count(), 5);
}

#[tokio::test]
async fn attach_sends_one_offer_with_manifest() {
    let mut alice = peer("alice", config());
    alice
        .handle
        .attach(stream_keys::USER, MediaKind::Audio, mic())
        .await
        .unwrap();

    let sent = drain(&mut alice).await;
    let offers = offers(&sent);
    assert_eq!(offers.len(), 1);
    let tracks = &offers[0].1;
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].key, "user");
    assert_eq!(tracks[0].kind, MediaKind::Audio);
    assert!(!tracks[0].mid.is_empty());
}

#[tokio::test]
async fn renegotiation_is_coalesced_while_offering() {
    let mut alice = peer("alice", config());
    let mut bob = peer("bob", config());

    alice
        .handle
        .attach(stream_keys::USER, MediaKind::Audio, mic())
        .await
        .unwrap();
    alice
        .handle
        .attach(stream_keys::USER, MediaKind::Video, LocalTrack::new(MediaKind::Video, "cam"))
        .await
        .unwrap();
    // Second attach lands while the first offer is unanswered.
    let first_round = drain(&mut alice).await;
    assert_eq!(offers(&first_round).len(), 1);
    assert_eq!(
        alice.handle.inspect().await.unwrap().state,
        NegotiationState::MakingOffer
    );

    deliver(&bob, "alice", &first_round).await;
    let (from_bob, from_alice) = settle(&mut bob, &mut alice).await;
    assert!(answers(&from_bob) >= 1);

    let follow_up = offers(&from_alice);
    assert!(!follow_up.is_empty());
    let (_, tracks) = follow_up.last().unwrap();
    assert!(tracks
        .iter()
        .any(|t| t.key == "user" && t.kind == MediaKind::Video));
}

#[tokio::test]
async fn stale_answer_is_dropped() {
    let alice = peer("alice", config());
    alice
        .handle
        .signal("bob", VoiceSignal::Answer { sdp: "v=0".into() })
        .await
        .unwrap();

    let snapshot = alice.handle.inspect().await.unwrap();
    assert_eq!(snapshot.state, NegotiationState::Idle);
}

#[tokio::test]
async fn malformed_offer_leaves_engine_usable() {
    let mut alice = peer("alice", config());
    alice
        .handle
        .signal(
            "bob",
            VoiceSignal::Offer {
                sdp: "garbage".into(),
                tracks: Vec::new(),
            },
        )
        .await
        .unwrap();

    let failed = timeout(Duration::from_secs(1), alice.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(failed, VoiceEvent::NegotiationFailed { .. }));
    assert_eq!(
        alice.handle.inspect().await.unwrap().state,
        NegotiationState::Stable
    );

    alice
        .handle
        .attach(stream_keys::USER, MediaKind::Audio, mic())
        .await
        .unwrap();
    assert_eq!(offers(&drain(&mut alice).await).len(), 1);
}

#[tokio::test]
async fn candidates_are_best_effort() {
    let (alice, _bob) = connected_pair().await;
    let candidate = IceCandidate {
        candidate: "candidate:9 1 udp 1 10.0.0.9 4000 typ host".into(),
        sdp_mid: Some("0".into()),
        sdp_m_line_index: Some(0),
        username_fragment: None,
    };
    let before = alice.connection.applied_candidates();
    for _ in 0..2 {
        alice
            .handle
            .signal("bob", VoiceSignal::Candidate(candidate.clone()))
            .await
            .unwrap();
    }
    let snapshot = alice.handle.inspect().await.unwrap();
    assert_eq!(snapshot.state, NegotiationState::Stable);
    assert_eq!(alice.connection.applied_candidates(), before + 1);
}

/// Both sides are stable and receive the other's microphone.
async fn assert_hear_each_other(a: &Peer, b: &Peer) {
    for (side, other) in [(a, &b.name), (b, &a.name)] {
        let key = format!("{other}:user");
        let streams = side.handle.remote_streams().await.unwrap();
        let stream = streams.iter().find(|s| s.id == key).unwrap();
        assert_eq!(stream.sink.tracks().len(), 1, "{} missing {key}", side.name);
        assert_eq!(
            side.handle.inspect().await.unwrap().state,
            NegotiationState::Stable
        );
    }
}

#[tokio::test]
async fn glare_yields_exactly_one_answer() {
    let (mut alice, mut bob) = connected_pair().await;

    let (alice_reply, bob_reply) = cross_offers(&mut alice, &mut bob).await;
    assert_eq!(answers(&alice_reply), 0, "impolite side must not answer");
    assert_eq!(answers(&bob_reply), 1, "polite side answers once");

    deliver(&alice, "bob", &bob_reply).await;
    deliver(&bob, "alice", &alice_reply).await;
    settle(&mut alice, &mut bob).await;
    assert_hear_each_other(&alice, &bob).await;
}

#[tokio::test]
async fn glare_with_default_roles_is_won_by_lower_user_id() {
    // Same defaults on both sides; only the ids differ.
    let (mut zoe, mut adam) = connect(peer("zoe", config()), peer("adam", config())).await;

    let (zoe_reply, adam_reply) = cross_offers(&mut zoe, &mut adam).await;
    assert_eq!(answers(&zoe_reply), 1);
    assert_eq!(answers(&adam_reply), 0);

    deliver(&adam, "zoe", &zoe_reply).await;
    deliver(&zoe, "adam", &adam_reply).await;
    settle(&mut zoe, &mut adam).await;
    assert_hear_each_other(&zoe, &adam).await;

    // Nothing is left coalesced behind a stuck offer.
    zoe.handle
        .attach(stream_keys::USER, MediaKind::Video, LocalTrack::new(MediaKind::Video, "cam"))
        .await
        .unwrap();
    let (from_zoe, _) = settle(&mut zoe, &mut adam).await;
    assert!(!offers(&from_zoe).is_empty());
}

#[tokio::test]
async fn configured_role_overrides_user_id() {
    let alice = peer(
        "alice",
        NegotiationConfig {
            polite: Some(true),
            ..config()
        },
    );
    let bob = peer(
        "bob",
        NegotiationConfig {
            polite: Some(false),
            ..config()
        },
    );
    let (mut alice, mut bob) = connect(alice, bob).await;

    let (alice_reply, bob_reply) = cross_offers(&mut alice, &mut bob).await;
    assert_eq!(answers(&alice_reply), 1);
    assert_eq!(answers(&bob_reply), 0);
}

#[tokio::test]
async fn ice_restart_replaces_a_lost_offer() {
    let (mut alice, mut bob) = connected_pair().await;
    alice
        .handle
        .attach(stream_keys::USER, MediaKind::Audio, mic())
        .await
        .unwrap();
    // The offer never reaches bob.
    assert_eq!(offers(&drain(&mut alice).await).len(), 1);

    alice.connection.fail_ice();
    let (from_alice, _) = settle(&mut alice, &mut bob).await;
    assert!(!offers(&from_alice).is_empty());
    assert_eq!(alice.connection.ice_generation(), 1);

    let streams = bob.handle.remote_streams().await.unwrap();
    let stream = streams.iter().find(|s| s.id == "alice:user").unwrap();
    assert_eq!(stream.sink.tracks().len(), 1);
    assert_eq!(
        alice.handle.inspect().await.unwrap().state,
        NegotiationState::Stable
    );
}

#[tokio::test]
async fn unanswered_offer_is_resent_after_timeout() {
    let alice = peer(
        "alice",
        NegotiationConfig {
            offer_timeout_ms: 1000,
            ..config()
        },
    );
    let (mut alice, mut bob) = connect(alice, peer("bob", config())).await;

    alice
        .handle
        .attach(stream_keys::USER, MediaKind::Audio, mic())
        .await
        .unwrap();
    assert_eq!(offers(&drain(&mut alice).await).len(), 1);
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let (from_alice, _) = settle(&mut alice, &mut bob).await;
    assert!(!offers(&from_alice).is_empty());
    let streams = bob.handle.remote_streams().await.unwrap();
    let stream = streams.iter().find(|s| s.id == "alice:user").unwrap();
    assert_eq!(stream.sink.tracks().len(), 1);

    // Later renegotiation is no longer coalesced away.
    alice
        .handle
        .attach(stream_keys::USER, MediaKind::Video, LocalTrack::new(MediaKind::Video, "cam"))
        .await
        .unwrap();
    let (from_alice, _) = settle(&mut alice, &mut bob).await;
    assert!(!offers(&from_alice).is_empty());
}

#[tokio::test]
async fn signals_from_a_third_participant_are_ignored() {
    let (mut alice, mut bob) = connected_pair().await;
    let mut carol = peer("carol", config());

    alice.handle.peer_joined("carol").await.unwrap();
    assert!(offers(&drain(&mut alice).await).is_empty());

    carol
        .handle
        .attach(stream_keys::USER, MediaKind::Audio, mic())
        .await
        .unwrap();
    let from_carol = drain(&mut carol).await;
    deliver(&alice, "carol", &from_carol).await;
    assert_eq!(answers(&drain(&mut alice).await), 0);

    // Alice's offer reaches both; only bob's answer completes it.
    alice
        .handle
        .attach(stream_keys::USER, MediaKind::Audio, mic())
        .await
        .unwrap();
    let from_alice = drain(&mut alice).await;
    deliver(&carol, "alice", &from_alice).await;
    let carol_reply = drain(&mut carol).await;
    assert_eq!(answers(&carol_reply), 1);
    deliver(&alice, "carol", &carol_reply).await;
    assert_eq!(
        alice.handle.inspect().await.unwrap().state,
        NegotiationState::MakingOffer
    );

    deliver(&bob, "alice", &from_alice).await;
    settle(&mut alice, &mut bob).await;
    let streams = alice.handle.remote_streams().await.unwrap();
    assert!(streams.iter().all(|s| s.user_id != "carol"));
    let streams = bob.handle.remote_streams().await.unwrap();
    let stream = streams.iter().find(|s| s.id == "alice:user").unwrap();
    assert_eq!(stream.sink.tracks().len(), 1);
    assert_eq!(
        alice.handle.inspect().await.unwrap().state,
        NegotiationState::Stable
    );
}

#[tokio::test]
async fn departed_peer_frees_the_connection() {
    let (mut alice, _bob) = connected_pair().await;
    alice.handle.remove_user("bob").await.unwrap();

    alice.handle.peer_joined("carol").await.unwrap();
    assert_eq!(offers(&drain(&mut alice).await).len(), 1);
}

#[tokio::test]
async fn ice_failure_restarts_with_same_tracks() {
    let (mut alice, mut bob) = connected_pair().await;
    alice
        .handle
        .attach(stream_keys::USER, MediaKind::Audio, mic())
        .await
        .unwrap();
    let (from_alice, _) = settle(&mut alice, &mut bob).await;
    let (before_sdp, before_tracks) = offers(&from_alice).pop().unwrap();

    alice.connection.fail_ice();
    let (from_alice, _) = settle(&mut alice, &mut bob).await;
    let (after_sdp, after_tracks) = offers(&from_alice).pop().unwrap();

    assert_ne!(ice_ufrag(&before_sdp), ice_ufrag(&after_sdp));
    assert_eq!(before_tracks, after_tracks);
    assert_eq!(alice.connection.ice_generation(), 1);
    assert_eq!(
        alice.state.borrow().connection_state,
        PeerConnectionState::Connected
    );
    assert_eq!(alice.handle.inspect().await.unwrap().restart_attempts, 0);
}

#[tokio::test]
async fn exhausted_restarts_report_failed() {
    let mut alice = peer(
        "alice",
        NegotiationConfig {
            ice_restart_max_attempts: 1,
            ..config()
        },
    );

    alice.connection.fail_ice();
    // The single allowed restart goes out but is never answered.
    assert_eq!(offers(&drain(&mut alice).await).len(), 1);
    assert_eq!(
        alice.state.borrow().connection_state,
        PeerConnectionState::Connecting
    );

    alice.connection.fail_ice();
    let mut exhausted = false;
    while let Ok(Ok(event)) = timeout(QUIET, alice.events.recv()).await {
        exhausted |= event == VoiceEvent::IceRestartsExhausted;
    }
    assert!(exhausted);
    assert_eq!(
        alice.state.borrow().connection_state,
        PeerConnectionState::Failed
    );
}

#[tokio::test]
async fn have_is_announced_after_exchange() {
    let (mut alice, mut bob) = connected_pair().await;
    alice
        .handle
        .attach(stream_keys::SCREEN, MediaKind::Video, LocalTrack::new(MediaKind::Video, "display"))
        .await
        .unwrap();
    let (from_alice, _) = settle(&mut alice, &mut bob).await;

    let last_have = from_alice
        .iter()
        .rev()
        .find_map(|s| match s {
            VoiceSignal::Have { user_id, tracks } => Some((user_id.clone(), tracks.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(last_have.0, "alice");
    assert_eq!(last_have.1.len(), 1);
    assert_eq!(last_have.1[0].key, "screen");
}

#[tokio::test]
async fn speaking_travels_as_side_channel() {
    let (mut alice, mut bob) = connected_pair().await;
    alice.handle.speaking(true).await.unwrap();
    let sent = drain(&mut alice).await;
    assert_eq!(sent, vec![VoiceSignal::Speaking { speaking: true }]);

    deliver(&bob, "alice", &sent).await;
    let event = timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(VoiceEvent::SpeakingChanged { user_id, speaking }) = bob.events.recv().await {
                return (user_id, speaking);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event, ("alice".to_string(), true));
    drain(&mut bob).await;
}

#[tokio::test]
async fn remove_user_drops_their_streams() {
    let (mut alice, mut bob) = connected_pair().await;
    bob.handle
        .attach(stream_keys::USER, MediaKind::Audio, mic())
        .await
        .unwrap();
    settle(&mut alice, &mut bob).await;
    assert_eq!(alice.handle.remote_streams().await.unwrap().len(), 1);

    alice.handle.remove_user("bob").await.unwrap();
    assert!(alice.handle.remote_streams().await.unwrap().is_empty());
}
