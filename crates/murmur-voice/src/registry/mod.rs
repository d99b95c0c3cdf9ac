//! Stream registry: logical stream keys on one side, transceivers and mids
//! on the other, for both local and remote media.
//!
//! Mids carry no meaning on their own. The local manifest tells the remote
//! peer which mid is which stream; `Have` announcements tell us the same
//! about the remote peer. Inbound tracks and `Have` messages race, so each
//! side is stored until the other shows up.

mod types;

#[cfg(test)]
mod tests;

pub use types::{LocalStream, MediaSink, RemoteStream, TransceiverHandle, TransceiverRecord};

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, warn};

use murmur_common::NegotiationError;

use crate::backend::PeerConnection;
use crate::media::{Direction, LocalTrack, RemoteTrack};
use crate::protocol::{stream_keys, MediaKind, TrackInfo};

/// The five slots every session reserves at connect time.
pub const STANDARD_SLOTS: [(&str, MediaKind); 5] = [
    (stream_keys::USER, MediaKind::Audio),
    (stream_keys::USER, MediaKind::Video),
    (stream_keys::SCREEN, MediaKind::Audio),
    (stream_keys::SCREEN, MediaKind::Video),
    (stream_keys::MUSIC, MediaKind::Audio),
];

#[derive(Debug, Default)]
pub struct StreamRegistry {
    local: BTreeMap<String, LocalStream>,
    /// Arena of reserved transceivers, indexed by `TransceiverHandle`.
    transceivers: Vec<TransceiverRecord>,
    remote: BTreeMap<String, RemoteStream>,
    /// Every inbound track seen so far, by mid.
    received: HashMap<String, RemoteTrack>,
    /// Users removed by a presence notification. Late `Have`s for them are
    /// dropped until they rejoin.
    departed: HashSet<String>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Local streams
    // -----------------------------------------------------------------------

    /// Register a local logical stream. Idempotent per key.
    pub fn create_local_stream(&mut self, key: &str) -> &LocalStream {
        self.local
            .entry(key.to_string())
            .or_insert_with(|| LocalStream {
                key: key.to_string(),
                slots: BTreeMap::new(),
            })
    }

    /// Reserve the inactive transceiver for `(key, kind)`. Reservation
    /// happens once per connection; repeated calls return the same handle.
    pub fn reserve_transceiver(
        &mut self,
        connection: &dyn PeerConnection,
        key: &str,
        kind: MediaKind,
    ) -> TransceiverHandle {
        if let Some(handle) = self.handle_for(key, kind) {
            return handle;
        }

        self.create_local_stream(key);
        let transceiver = connection.add_transceiver(kind, Direction::Inactive);
        let handle = TransceiverHandle(self.transceivers.len());
        self.transceivers.push(TransceiverRecord {
            key: key.to_string(),
            kind,
            transceiver,
            mid: None,
            direction: Direction::Inactive,
            track: None,
        });
        if let Some(stream) = self.local.get_mut(key) {
            stream.slots.insert(kind, handle);
        }
        debug!(key, %kind, ?transceiver, "Reserved transceiver");
        handle
    }

    pub fn handle_for(&self, key: &str, kind: MediaKind) -> Option<TransceiverHandle> {
        self.local.get(key)?.slots.get(&kind).copied()
    }

    pub fn transceiver(&self, handle: TransceiverHandle) -> Option<&TransceiverRecord> {
        self.transceivers.get(handle.0)
    }

    pub fn transceiver_count(&self) -> usize {
        self.transceivers.len()
    }

    /// Point the reserved transceiver at `track` and make it send-only.
    /// The transceiver itself is reused, never recreated.
    pub fn bind_track(
        &mut self,
        connection: &dyn PeerConnection,
        key: &str,
        kind: MediaKind,
        track: LocalTrack,
    ) -> Result<TransceiverHandle, NegotiationError> {
        let handle = self.handle_for(key, kind).ok_or_else(|| {
            NegotiationError::InvalidState(format!("no transceiver reserved for {key}/{kind}"))
        })?;
        let record = &mut self.transceivers[handle.0];

        connection.replace_track(record.transceiver, Some(track.clone()))?;
        connection.set_direction(record.transceiver, Direction::SendOnly)?;
        record.track = Some(track);
        record.direction = Direction::SendOnly;
        Ok(handle)
    }

    /// Pull mid assignments from the connection into the arena. A mid that
    /// disappears was only proposed by an offer that got rolled back.
    pub fn sync_mids(&mut self, connection: &dyn PeerConnection) {
        for record in &mut self.transceivers {
            let assigned = connection.mid(record.transceiver);
            match (&record.mid, assigned) {
                (None, Some(mid)) => {
                    debug!(key = %record.key, kind = %record.kind, %mid, "Mid assigned");
                    record.mid = Some(mid);
                }
                (Some(mid), None) => {
                    debug!(key = %record.key, kind = %record.kind, %mid, "Mid withdrawn by rollback");
                    record.mid = None;
                }
                (Some(known), Some(mid)) if *known != mid => {
                    warn!(known = %known, reported = %mid, "Connection reported a different mid, keeping the first");
                }
                _ => {}
            }
        }
    }

    /// Reserved transceivers still waiting for a mid.
    pub fn has_unassigned(&self) -> bool {
        self.transceivers.iter().any(|r| r.mid.is_none())
    }

    /// `{key, kind, mid}` for every transceiver currently publishing.
    pub fn track_manifest(&self) -> Vec<TrackInfo> {
        self.transceivers
            .iter()
            .filter(|r| r.is_publishing())
            .filter_map(|r| {
                Some(TrackInfo {
                    key: r.key.clone(),
                    kind: r.kind,
                    mid: r.mid.clone()?,
                })
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Remote streams
    // -----------------------------------------------------------------------

    /// Apply a `Have` announcement. Returns the ids of streams whose
    /// contents changed.
    pub fn handle_have(&mut self, user_id: &str, tracks: &[TrackInfo]) -> Vec<String> {
        let mut changed = Vec::new();
        if self.departed.contains(user_id) {
            debug!(user_id, "Dropping Have for a departed user");
            return changed;
        }

        for info in tracks {
            let stream_id = RemoteStream::stream_id(user_id, &info.key);

            // A mid belongs to one stream; a reassigned mid moves.
            for other in self.remote.values_mut() {
                if other.id != stream_id && other.mids.remove(&info.mid) {
                    other.sink.remove_mid(&info.mid);
                    debug!(mid = %info.mid, from = %other.id, to = %stream_id, "Mid reassigned");
                    push_unique(&mut changed, &other.id);
                }
            }

            let stream = self
                .remote
                .entry(stream_id.clone())
                .or_insert_with(|| RemoteStream::new(user_id, &info.key));
            let added = stream.mids.insert(info.mid.clone());

            let mut attached = false;
            if let Some(track) = self.received.get(&info.mid) {
                if !stream.sink.contains(&info.mid) {
                    stream.sink.insert(track.clone());
                    attached = true;
                }
            }

            if added || attached {
                push_unique(&mut changed, &stream_id);
            }
        }

        changed
    }

    /// Record an inbound track. Returns the stream it was attached to, or
    /// `None` if no `Have` has claimed its mid yet.
    pub fn handle_track(&mut self, track: RemoteTrack) -> Option<String> {
        self.received.insert(track.mid.clone(), track.clone());

        let stream = self
            .remote
            .values_mut()
            .find(|s| s.mids.contains(&track.mid));
        match stream {
            Some(stream) => {
                stream.sink.insert(track);
                Some(stream.id.clone())
            }
            None => {
                debug!(mid = %track.mid, "Holding track until a Have claims its mid");
                None
            }
        }
    }

    /// Drop every remote stream owned by `user_id`. Returns removed ids.
    pub fn remove_user(&mut self, user_id: &str) -> Vec<String> {
        let removed: Vec<String> = self
            .remote
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.id.clone())
            .collect();
        for id in &removed {
            self.remote.remove(id);
        }
        self.departed.insert(user_id.to_string());
        removed
    }

    /// Accept announcements from a user again after they rejoin.
    pub fn readmit(&mut self, user_id: &str) {
        self.departed.remove(user_id);
    }

    pub fn remote_stream(&self, id: &str) -> Option<&RemoteStream> {
        self.remote.get(id)
    }

    pub fn remote_streams(&self) -> Vec<RemoteStream> {
        self.remote.values().cloned().collect()
    }
}

fn push_unique(ids: &mut Vec<String>, id: &str) {
    if !ids.iter().any(|existing| existing == id) {
        ids.push(id.to_string());
    }
}
