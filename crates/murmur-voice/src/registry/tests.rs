use super::*;
use crate::loopback::LoopbackConnection;

fn info(key: &str, kind: MediaKind, mid: &str) -> TrackInfo {
    TrackInfo {
        key: key.into(),
        kind,
        mid: mid.into(),
    }
}

fn remote(kind: MediaKind, mid: &str) -> RemoteTrack {
    RemoteTrack {
        id: format!("track-{mid}"),
        kind,
        mid: mid.into(),
    }
}

#[test]
fn reserve_is_idempotent_per_slot() {
    let (conn, _events) = LoopbackConnection::open();
    let mut registry = StreamRegistry::new();

    for (key, kind) in STANDARD_SLOTS {
        registry.reserve_transceiver(&*conn, key, kind);
    }
    let again = registry.reserve_transceiver(&*conn, "user", MediaKind::Audio);

    assert_eq!(registry.transceiver_count(), 5);
    assert_eq!(conn.transceiver_count(), 5);
    assert_eq!(registry.handle_for("user", MediaKind::Audio), Some(again));
    assert!(registry.has_unassigned());
}

#[test]
fn bind_requires_a_reservation() {
    let (conn, _events) = LoopbackConnection::open();
    let mut registry = StreamRegistry::new();
    let track = LocalTrack::new(MediaKind::Video, "cam");

    let err = registry
        .bind_track(&*conn, "user", MediaKind::Video, track)
        .unwrap_err();
    assert!(matches!(err, NegotiationError::InvalidState(_)));
}

#[tokio::test]
async fn manifest_lists_publishing_slots_with_mids() {
    use crate::media::OfferOptions;

    let (conn, _events) = LoopbackConnection::open();
    let mut registry = StreamRegistry::new();
    for (key, kind) in STANDARD_SLOTS {
        registry.reserve_transceiver(&*conn, key, kind);
    }

    let mic = LocalTrack::new(MediaKind::Audio, "mic");
    let handle = registry
        .bind_track(&*conn, "user", MediaKind::Audio, mic.clone())
        .unwrap();
    assert_eq!(
        registry.transceiver(handle).map(|r| r.direction),
        Some(Direction::SendOnly)
    );
    // No mid yet, so nothing to announce.
    assert!(registry.track_manifest().is_empty());

    let offer = conn.create_offer(OfferOptions::default()).await.unwrap();
    conn.set_local_description(offer).await.unwrap();
    registry.sync_mids(&*conn);
    assert!(!registry.has_unassigned());

    let manifest = registry.track_manifest();
    assert_eq!(manifest, vec![info("user", MediaKind::Audio, "0")]);

    mic.set_enabled(false);
    assert!(registry.track_manifest().is_empty());
}

#[test]
fn have_then_track_matches_track_then_have() {
    let tracks = [info("screen", MediaKind::Video, "3")];

    let mut have_first = StreamRegistry::new();
    assert_eq!(have_first.handle_have("bob", &tracks), vec!["bob:screen"]);
    assert_eq!(
        have_first.handle_track(remote(MediaKind::Video, "3")).as_deref(),
        Some("bob:screen")
    );

    let mut track_first = StreamRegistry::new();
    assert_eq!(track_first.handle_track(remote(MediaKind::Video, "3")), None);
    assert!(track_first.remote_streams().is_empty());
    assert_eq!(track_first.handle_have("bob", &tracks), vec!["bob:screen"]);

    assert_eq!(have_first.remote_streams(), track_first.remote_streams());
    let stream = track_first.remote_stream("bob:screen").unwrap();
    assert_eq!(stream.sink.tracks().len(), 1);
    assert_eq!(stream.sink.tracks()[0].mid, "3");
}

#[test]
fn repeated_have_reports_no_change() {
    let mut registry = StreamRegistry::new();
    let tracks = [info("user", MediaKind::Audio, "0")];
    assert_eq!(registry.handle_have("bob", &tracks).len(), 1);
    assert!(registry.handle_have("bob", &tracks).is_empty());
}

#[test]
fn reassigned_mid_moves_between_streams() {
    let mut registry = StreamRegistry::new();
    registry.handle_have("bob", &[info("music", MediaKind::Audio, "4")]);
    registry.handle_track(remote(MediaKind::Audio, "4"));

    let changed = registry.handle_have("bob", &[info("screen", MediaKind::Audio, "4")]);
    assert!(changed.contains(&"bob:music".to_string()));
    assert!(changed.contains(&"bob:screen".to_string()));

    let music = registry.remote_stream("bob:music").unwrap();
    assert!(music.mids.is_empty());
    assert!(music.sink.is_empty());
    let screen = registry.remote_stream("bob:screen").unwrap();
    assert!(screen.sink.contains("4"));
}

#[test]
fn remove_user_drops_only_their_streams() {
    let mut registry = StreamRegistry::new();
    registry.handle_have(
        "bob",
        &[
            info("user", MediaKind::Audio, "0"),
            info("screen", MediaKind::Video, "3"),
        ],
    );
    registry.handle_have("carol", &[info("user", MediaKind::Audio, "7")]);

    let mut removed = registry.remove_user("bob");
    removed.sort();
    assert_eq!(removed, vec!["bob:screen", "bob:user"]);
    assert!(registry.remote_stream("bob:user").is_none());
    assert!(registry.remote_stream("carol:user").is_some());
    assert!(registry.remove_user("bob").is_empty());
}

#[test]
fn have_for_departed_user_is_dropped_until_rejoin() {
    let mut registry = StreamRegistry::new();
    let tracks = [info("user", MediaKind::Audio, "0")];
    registry.handle_have("bob", &tracks);
    registry.remove_user("bob");

    assert!(registry.handle_have("bob", &tracks).is_empty());
    assert!(registry.remote_streams().is_empty());

    registry.readmit("bob");
    assert_eq!(registry.handle_have("bob", &tracks), vec!["bob:user"]);
}
