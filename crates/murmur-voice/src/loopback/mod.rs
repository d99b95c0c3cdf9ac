//! In-process backends: a peer connection that negotiates without moving
//! media, synthetic capture devices, and a channel-backed transport. Used
//! by the test suites and the `murmur-sim` binary.

mod capture;
mod connection;
mod sdp;
mod transport;

pub use capture::LoopbackCapture;
pub use connection::{LoopbackConnection, LoopbackFactory, SignalingState};
pub use sdp::ice_ufrag;
pub use transport::ChannelTransport;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ConnectionEvent, PeerConnection};
    use crate::media::{Direction, IceCandidate, OfferOptions, PeerConnectionState};
    use crate::protocol::MediaKind;

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn full_exchange_assigns_mids_and_fires_tracks() {
        let (a, mut a_events) = LoopbackConnection::open();
        let (b, mut b_events) = LoopbackConnection::open();

        let tx = a.add_transceiver(MediaKind::Audio, Direction::SendOnly);
        a.add_transceiver(MediaKind::Video, Direction::Inactive);

        let offer = a.create_offer(OfferOptions::default()).await.unwrap();
        assert_eq!(a.mid(tx), None);
        a.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(a.mid(tx).as_deref(), Some("0"));
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);

        b.set_remote_description(offer).await.unwrap();
        assert_eq!(b.transceiver_count(), 2);
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::Stable);

        let tracks: Vec<_> = drain(&mut b_events)
            .into_iter()
            .filter_map(|e| match e {
                ConnectionEvent::Track(t) => Some(t),
                _ => None,
            })
            .collect();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].mid, "0");
        assert_eq!(tracks[0].kind, MediaKind::Audio);

        assert!(drain(&mut a_events).iter().any(|e| matches!(
            e,
            ConnectionEvent::ConnectionState(PeerConnectionState::Connected)
        )));
    }

    #[tokio::test]
    async fn rollback_forgets_pending_mids() {
        let (a, _events) = LoopbackConnection::open();
        let tx = a.add_transceiver(MediaKind::Audio, Direction::SendOnly);
        let offer = a.create_offer(OfferOptions::default()).await.unwrap();
        a.set_local_description(offer).await.unwrap();
        assert!(a.mid(tx).is_some());

        a.rollback().await.unwrap();
        assert_eq!(a.mid(tx), None);
        assert_eq!(a.signaling_state(), SignalingState::Stable);
        // Rolling back in stable is a no-op.
        a.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn ice_restart_changes_credentials() {
        let (a, _events) = LoopbackConnection::open();
        a.add_transceiver(MediaKind::Audio, Direction::SendOnly);
        let first = a.create_offer(OfferOptions::default()).await.unwrap();
        let restarted = a
            .create_offer(OfferOptions { ice_restart: true })
            .await
            .unwrap();
        assert_ne!(ice_ufrag(&first.sdp), ice_ufrag(&restarted.sdp));
        assert_eq!(a.ice_generation(), 1);
    }

    #[tokio::test]
    async fn candidates_need_a_remote_description() {
        let (a, _events) = LoopbackConnection::open();
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 127.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        assert!(a.add_ice_candidate(candidate.clone()).await.is_err());

        a.close();
        assert!(a.is_closed());
        assert_eq!(
            a.add_ice_candidate(candidate).await,
            Err(murmur_common::NegotiationError::Closed)
        );
    }

    #[tokio::test]
    async fn capture_counts_and_fails_on_request() {
        use crate::backend::CaptureBackend;
        use crate::media::CaptureSource;
        use murmur_common::DeviceError;

        let capture = LoopbackCapture::new();
        let track = capture.acquire(CaptureSource::Microphone).await.unwrap();
        assert_eq!(track.kind(), MediaKind::Audio);
        assert_eq!(capture.acquisitions(CaptureSource::Microphone), 1);

        capture.fail_with(CaptureSource::Camera, DeviceError::PermissionDenied);
        assert_eq!(
            capture.acquire(CaptureSource::Camera).await.unwrap_err(),
            DeviceError::PermissionDenied
        );
        assert_eq!(capture.total_acquisitions(), 1);

        let mut frames = capture.audio_frames(&track).unwrap();
        assert_eq!(capture.push_audio(&[0.5; 4]), 1);
        assert_eq!(frames.recv().await.unwrap().len(), 4);

        track.stop();
        assert_eq!(capture.push_audio(&[0.5; 4]), 0);
    }
}
