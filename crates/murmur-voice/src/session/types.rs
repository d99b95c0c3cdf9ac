use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::{CaptureBackend, ConnectionFactory, SignalingTransport};
use crate::media::PeerConnectionState;
use crate::registry::RemoteStream;

/// The externally observable voice state. Published through a `watch`
/// channel; every field change notifies subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceStateSnapshot {
    /// `None` when not in a voice channel.
    pub channel_id: Option<String>,
    pub muted: bool,
    pub camera_hidden: bool,
    pub screenshare_enabled: bool,
    pub music_playing: bool,
    /// Local voice activity.
    pub speaking: bool,
    pub connection_state: PeerConnectionState,
    /// Everyone the presence feed has reported in a voice channel,
    /// `user_id -> channel_id`.
    pub participants: BTreeMap<String, String>,
}

impl Default for VoiceStateSnapshot {
    fn default() -> Self {
        Self {
            channel_id: None,
            muted: true,
            camera_hidden: true,
            screenshare_enabled: false,
            music_playing: false,
            speaking: false,
            connection_state: PeerConnectionState::New,
            participants: BTreeMap::new(),
        }
    }
}

impl VoiceStateSnapshot {
    /// Reset everything owned by the session, keeping the presence view.
    pub(crate) fn clear_session(&mut self) {
        let participants = std::mem::take(&mut self.participants);
        *self = Self {
            participants,
            connection_state: PeerConnectionState::Closed,
            ..Self::default()
        };
    }
}

/// Notifications for UI consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    Connected {
        channel_id: String,
    },
    Disconnected {
        channel_id: String,
    },
    ConnectionStateChanged(PeerConnectionState),
    SpeakingChanged {
        user_id: String,
        speaking: bool,
    },
    RemoteStreamUpdated(RemoteStream),
    RemoteStreamRemoved {
        stream_id: String,
    },
    NegotiationFailed {
        reason: String,
    },
    IceRestartsExhausted,
}

/// The collaborators a session drives.
#[derive(Clone)]
pub struct VoiceBackends {
    pub connections: Arc<dyn ConnectionFactory>,
    pub capture: Arc<dyn CaptureBackend>,
    pub transport: Arc<dyn SignalingTransport>,
}
