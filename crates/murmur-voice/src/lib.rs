//! Real-time voice and video signaling for murmur.
//!
//! One [`VoiceSession`] per client holds at most one peer connection per
//! voice channel and multiplexes the logical streams (`user`, `screen`,
//! `music`) over it. Signaling rides the chat transport as JSON
//! [`Envelope`]s; media never passes through this crate.
//!
//! Layers, leaves first:
//!
//! - [`vad`]: voice activity detection on local audio frames.
//! - [`tracks`]: capture devices bound to reserved transceivers.
//! - [`registry`]: stream keys to transceivers and mids, both directions.
//! - [`negotiation`]: the offer/answer state machine, one task per session.
//! - [`session`]: connect, disconnect, toggles and the observable state.

pub mod backend;
pub mod loopback;
pub mod media;
pub mod negotiation;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod tracks;
pub mod vad;

pub use backend::{CaptureBackend, ConnectionEvent, ConnectionFactory, PeerConnection, SignalingTransport};
pub use media::{CaptureSource, LocalTrack, PeerConnectionState, RemoteTrack};
pub use negotiation::{EngineHandle, EngineSnapshot, NegotiationState};
pub use protocol::{stream_keys, Envelope, MediaKind, TrackInfo, VoiceChannelState, VoiceSignal};
pub use registry::{RemoteStream, StreamRegistry, STANDARD_SLOTS};
pub use session::{VoiceBackends, VoiceEvent, VoiceSession, VoiceStateSnapshot};
pub use tracks::{EnableOutcome, TrackController};
pub use vad::VoiceActivityDetector;
