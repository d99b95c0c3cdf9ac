//! Collaborator seams: the peer connection, device capture, and the
//! signaling transport. Production builds plug in real backends; tests and
//! the simulator use [`crate::loopback`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use murmur_common::{DeviceError, NegotiationError, TransportError};

use crate::media::{
    AudioFrame, CaptureSource, Direction, IceCandidate, IceConnectionState, LocalTrack,
    OfferOptions, PeerConnectionState, RemoteTrack, SessionDescription, TransceiverId,
};
use crate::protocol::{Envelope, MediaKind};

/// The single underlying peer connection of a voice session.
///
/// Methods take `&self`; implementations synchronize internally so the
/// session can close the connection while the negotiation task holds it.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn add_transceiver(&self, kind: MediaKind, direction: Direction) -> TransceiverId;

    fn set_direction(&self, id: TransceiverId, direction: Direction)
        -> Result<(), NegotiationError>;

    fn replace_track(
        &self,
        id: TransceiverId,
        track: Option<LocalTrack>,
    ) -> Result<(), NegotiationError>;

    /// Mid assigned by negotiation, `None` until then.
    fn mid(&self, id: TransceiverId) -> Option<String>;

    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Discard a pending local or remote offer and return to stable.
    async fn rollback(&self) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Asynchronous notifications raised by a peer connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    NegotiationNeeded,
    /// The remote peer started sending media on a mid.
    Track(RemoteTrack),
    IceCandidate(IceCandidate),
    IceConnectionState(IceConnectionState),
    ConnectionState(PeerConnectionState),
}

/// Creates a fresh connection per session. Never hands out a connection
/// twice.
pub trait ConnectionFactory: Send + Sync {
    fn create(
        &self,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<ConnectionEvent>), NegotiationError>;
}

/// Device capture (microphone, camera, display, background audio).
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Open a device. May suspend indefinitely on a permission prompt.
    async fn acquire(&self, source: CaptureSource) -> Result<LocalTrack, DeviceError>;

    /// Raw frames of a live audio track, for voice-activity detection.
    fn audio_frames(&self, _track: &LocalTrack) -> Option<mpsc::Receiver<AudioFrame>> {
        None
    }
}

/// Outbound half of the chat transport.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}
