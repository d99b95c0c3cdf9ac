//! Records kept by the stream registry.

use std::collections::{BTreeMap, BTreeSet};

use crate::media::{Direction, LocalTrack, RemoteTrack, TransceiverId};
use crate::protocol::MediaKind;

// ---------------------------------------------------------------------------
// Local side
// ---------------------------------------------------------------------------

/// Opaque handle into the registry's transceiver arena. Valid for the
/// lifetime of the connection it was reserved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransceiverHandle(pub(crate) usize);

/// A reserved transceiver. Before negotiation it is known only by its
/// connection-level id; `mid` is filled in once and never changes.
#[derive(Debug, Clone)]
pub struct TransceiverRecord {
    pub key: String,
    pub kind: MediaKind,
    pub transceiver: TransceiverId,
    pub mid: Option<String>,
    pub direction: Direction,
    pub track: Option<LocalTrack>,
}

impl TransceiverRecord {
    /// Carries an enabled track in a sending direction.
    pub fn is_publishing(&self) -> bool {
        self.direction != Direction::Inactive
            && self
                .track
                .as_ref()
                .is_some_and(|t| t.is_enabled() && !t.is_stopped())
    }
}

/// A named local role (`user`, `screen`, `music`) and its reserved slots.
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    pub key: String,
    pub slots: BTreeMap<MediaKind, TransceiverHandle>,
}

// ---------------------------------------------------------------------------
// Remote side
// ---------------------------------------------------------------------------

/// Output sink of a remote stream: the tracks currently feeding it, at most
/// one per mid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaSink {
    tracks: Vec<RemoteTrack>,
}

impl MediaSink {
    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn contains(&self, mid: &str) -> bool {
        self.tracks.iter().any(|t| t.mid == mid)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub(crate) fn insert(&mut self, track: RemoteTrack) {
        self.tracks.retain(|t| t.mid != track.mid);
        self.tracks.push(track);
        self.tracks.sort_by(|a, b| a.mid.cmp(&b.mid));
    }

    pub(crate) fn remove_mid(&mut self, mid: &str) {
        self.tracks.retain(|t| t.mid != mid);
    }
}

/// Everything one remote user publishes under one stream key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    /// `"{user_id}:{key}"`.
    pub id: String,
    pub user_id: String,
    pub key: String,
    pub mids: BTreeSet<String>,
    pub sink: MediaSink,
}

impl RemoteStream {
    pub fn stream_id(user_id: &str, key: &str) -> String {
        format!("{user_id}:{key}")
    }

    pub(crate) fn new(user_id: &str, key: &str) -> Self {
        Self {
            id: Self::stream_id(user_id, key),
            user_id: user_id.to_string(),
            key: key.to_string(),
            mids: BTreeSet::new(),
            sink: MediaSink::default(),
        }
    }
}
