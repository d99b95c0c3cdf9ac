//! Wire types for voice signaling.
//!
//! Signaling rides inside the chat transport as JSON envelopes keyed by
//! `type`. A `VoiceDispatch` envelope carries one [`VoiceSignal`]; a
//! `VoiceState` envelope carries a participant's presence in a voice
//! channel.

use serde::{Deserialize, Serialize};

use murmur_common::TransportError;

use crate::media::IceCandidate;

// ---------------------------------------------------------------------------
// Stream keys
// ---------------------------------------------------------------------------

/// Standard logical stream keys. The namespace is free-form; these are
/// the ones every session reserves.
pub mod stream_keys {
    pub const USER: &str = "user";
    pub const SCREEN: &str = "screen";
    pub const MUSIC: &str = "music";
}

// ---------------------------------------------------------------------------
// Track manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Media type token used on SDP `m=` lines.
    pub fn as_sdp(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    pub fn from_sdp(token: &str) -> Option<Self> {
        match token {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sdp())
    }
}

/// One entry of a track manifest: which logical stream a mid carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackInfo {
    pub key: String,
    pub kind: MediaKind,
    pub mid: String,
}

// ---------------------------------------------------------------------------
// Signaling messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VoiceSignal {
    /// SDP offer plus the sender's track manifest.
    Offer { sdp: String, tracks: Vec<TrackInfo> },
    Answer { sdp: String },
    /// Trickled ICE candidate.
    Candidate(IceCandidate),
    /// Announces which mids carry which of `user_id`'s logical streams.
    Have {
        user_id: String,
        tracks: Vec<TrackInfo>,
    },
    /// Advisory: the sender would like media on `mid`.
    Want { mid: String },
    /// Voice-activity side channel; not part of SDP negotiation.
    Speaking { speaking: bool },
}

impl VoiceSignal {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate(_) => "candidate",
            Self::Have { .. } => "have",
            Self::Want { .. } => "want",
            Self::Speaking { .. } => "speaking",
        }
    }
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Presence payload of a `VoiceState` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceChannelState {
    pub channel_id: Option<String>,
}

/// Outer message as carried by the chat transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    VoiceDispatch {
        user_id: String,
        payload: VoiceSignal,
    },
    VoiceState {
        user_id: String,
        state: Option<VoiceChannelState>,
    },
    /// Any other transport message; ignored by the voice engine.
    #[serde(other)]
    Unknown,
}

impl Envelope {
    pub fn dispatch(user_id: &str, payload: VoiceSignal) -> Self {
        Self::VoiceDispatch {
            user_id: user_id.to_string(),
            payload,
        }
    }

    pub fn presence(user_id: &str, channel_id: Option<&str>) -> Self {
        Self::VoiceState {
            user_id: user_id.to_string(),
            state: Some(VoiceChannelState {
                channel_id: channel_id.map(str::to_string),
            }),
        }
    }

    /// Channel named by a `VoiceState` envelope. A null state and a null
    /// `channel_id` both mean "not in voice".
    pub fn presence_channel(state: &Option<VoiceChannelState>) -> Option<&str> {
        state.as_ref().and_then(|s| s.channel_id.as_deref())
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Serialize(e.to_string()))
    }
}
