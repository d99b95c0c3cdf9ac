//! In-memory peer connection.
//!
//! Implements offer/answer bookkeeping the way a browser connection does
//! (mids assigned on the local offer, receive transceivers created for
//! unknown remote sections, tracks fired when the remote side sends) but
//! moves no media. Renegotiation is driven by the engine, so this
//! connection never raises `NegotiationNeeded` on its own.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use murmur_common::NegotiationError;

use crate::backend::{ConnectionEvent, ConnectionFactory, PeerConnection};
use crate::media::{
    Direction, IceCandidate, IceConnectionState, LocalTrack, OfferOptions, PeerConnectionState,
    RemoteTrack, SdpType, SessionDescription, TransceiverId,
};
use crate::protocol::MediaKind;

use super::sdp::{MediaSection, SessionSdp};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl SignalingState {
    fn name(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug)]
struct Transceiver {
    kind: MediaKind,
    direction: Direction,
    mid: Option<String>,
    track: Option<LocalTrack>,
}

#[derive(Debug)]
struct Inner {
    transceivers: Vec<Transceiver>,
    signaling: SignalingState,
    session_id: u64,
    version: u64,
    ice_ufrag: String,
    ice_generation: u32,
    gathered_generation: Option<u32>,
    local_sdp: Option<String>,
    remote: Option<SessionSdp>,
    /// Transceivers that received their mid from the pending local offer.
    pending_mids: Vec<usize>,
    fired: HashSet<String>,
    candidates: Vec<IceCandidate>,
    ice_connected: bool,
}

pub struct LoopbackConnection {
    inner: Mutex<Inner>,
    events: mpsc::Sender<ConnectionEvent>,
}

impl LoopbackConnection {
    pub fn new(events: mpsc::Sender<ConnectionEvent>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                transceivers: Vec::new(),
                signaling: SignalingState::Stable,
                session_id: rand::random::<u64>() >> 2,
                version: 1,
                ice_ufrag: new_ufrag(),
                ice_generation: 0,
                gathered_generation: None,
                local_sdp: None,
                remote: None,
                pending_mids: Vec::new(),
                fired: HashSet::new(),
                candidates: Vec::new(),
                ice_connected: false,
            }),
            events,
        }
    }

    /// Standalone connection plus its event stream.
    pub fn open() -> (Arc<Self>, mpsc::Receiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        (Arc::new(Self::new(tx)), rx)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!(error = %e, "Dropping loopback connection event");
        }
    }

    // -----------------------------------------------------------------------
    // Inspection & fault injection
    // -----------------------------------------------------------------------

    pub fn signaling_state(&self) -> SignalingState {
        self.lock().signaling
    }

    pub fn transceiver_count(&self) -> usize {
        self.lock().transceivers.len()
    }

    pub fn direction(&self, id: TransceiverId) -> Option<Direction> {
        self.lock().transceivers.get(id.0 as usize).map(|t| t.direction)
    }

    pub fn sending_track(&self, id: TransceiverId) -> Option<LocalTrack> {
        self.lock()
            .transceivers
            .get(id.0 as usize)
            .and_then(|t| t.track.clone())
    }

    pub fn local_description(&self) -> Option<String> {
        self.lock().local_sdp.clone()
    }

    pub fn ice_generation(&self) -> u32 {
        self.lock().ice_generation
    }

    pub fn applied_candidates(&self) -> usize {
        self.lock().candidates.len()
    }

    /// Simulate connectivity loss on the current ICE generation.
    pub fn fail_ice(&self) {
        self.lock().ice_connected = false;
        self.emit(ConnectionEvent::IceConnectionState(IceConnectionState::Failed));
        self.emit(ConnectionEvent::ConnectionState(PeerConnectionState::Failed));
    }

    /// Raise an arbitrary event, e.g. a track on a mid no `Have` named.
    pub fn inject(&self, event: ConnectionEvent) {
        self.emit(event);
    }

    // -----------------------------------------------------------------------
    // Offer / answer
    // -----------------------------------------------------------------------

    fn offer_sync(&self, options: OfferOptions) -> Result<SessionDescription, NegotiationError> {
        let mut inner = self.lock();
        match inner.signaling {
            SignalingState::Closed => return Err(NegotiationError::Closed),
            SignalingState::HaveRemoteOffer => {
                return Err(NegotiationError::InvalidState(inner.signaling.name().into()))
            }
            _ => {}
        }
        if options.ice_restart {
            inner.ice_ufrag = new_ufrag();
            inner.ice_generation += 1;
        }

        let mut used: HashSet<String> = inner
            .transceivers
            .iter()
            .filter_map(|t| t.mid.clone())
            .collect();
        let sections = inner
            .transceivers
            .iter()
            .map(|t| MediaSection {
                kind: t.kind,
                mid: t.mid.clone().unwrap_or_else(|| allocate_mid(&mut used)),
                direction: t.direction,
            })
            .collect();

        inner.version += 1;
        let sdp = SessionSdp {
            session_id: inner.session_id,
            version: inner.version,
            ice_ufrag: inner.ice_ufrag.clone(),
            sections,
        };
        Ok(SessionDescription::offer(sdp.write()))
    }

    fn answer_sync(&self) -> Result<SessionDescription, NegotiationError> {
        let mut inner = self.lock();
        if inner.signaling != SignalingState::HaveRemoteOffer {
            return Err(NegotiationError::InvalidState(inner.signaling.name().into()));
        }
        let remote = inner
            .remote
            .clone()
            .ok_or_else(|| NegotiationError::InvalidState("no remote offer".into()))?;

        let sections = remote
            .sections
            .iter()
            .map(|section| {
                let ours = inner
                    .transceivers
                    .iter()
                    .find(|t| t.mid.as_deref() == Some(section.mid.as_str()))
                    .map(|t| t.direction)
                    .unwrap_or(Direction::Inactive);
                MediaSection {
                    kind: section.kind,
                    mid: section.mid.clone(),
                    direction: Direction::from_flags(
                        ours.sends() && section.direction.receives(),
                        ours.receives() && section.direction.sends(),
                    ),
                }
            })
            .collect();

        inner.version += 1;
        let sdp = SessionSdp {
            session_id: inner.session_id,
            version: inner.version,
            ice_ufrag: inner.ice_ufrag.clone(),
            sections,
        };
        Ok(SessionDescription::answer(sdp.write()))
    }

    fn set_local_sync(&self, description: SessionDescription) -> Result<(), NegotiationError> {
        let parsed = SessionSdp::parse(&description.sdp)?;
        let mut events = Vec::new();
        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            match (description.sdp_type, inner.signaling) {
                (_, SignalingState::Closed) => return Err(NegotiationError::Closed),
                (SdpType::Offer, SignalingState::Stable) => {
                    for (index, section) in parsed.sections.iter().enumerate() {
                        if let Some(t) = inner.transceivers.get_mut(index) {
                            if t.mid.is_none() {
                                t.mid = Some(section.mid.clone());
                                inner.pending_mids.push(index);
                            }
                        }
                    }
                    inner.signaling = SignalingState::HaveLocalOffer;
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                    inner.signaling = SignalingState::Stable;
                    complete_exchange(inner, &mut events);
                }
                (_, state) => return Err(NegotiationError::InvalidState(state.name().into())),
            }
            inner.local_sdp = Some(description.sdp);

            if inner.gathered_generation != Some(inner.ice_generation) {
                inner.gathered_generation = Some(inner.ice_generation);
                events.push(ConnectionEvent::IceCandidate(IceCandidate {
                    candidate: format!(
                        "candidate:1 1 udp 2122260223 127.0.0.1 {} typ host",
                        50000 + inner.ice_generation
                    ),
                    sdp_mid: parsed.sections.first().map(|s| s.mid.clone()),
                    sdp_m_line_index: Some(0),
                    username_fragment: Some(inner.ice_ufrag.clone()),
                }));
            }
        }
        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    fn set_remote_sync(&self, description: SessionDescription) -> Result<(), NegotiationError> {
        let parsed = SessionSdp::parse(&description.sdp)?;
        let mut events = Vec::new();
        {
            let mut inner = self.lock();
            match (description.sdp_type, inner.signaling) {
                (_, SignalingState::Closed) => return Err(NegotiationError::Closed),
                (SdpType::Offer, SignalingState::Stable) => {
                    for section in &parsed.sections {
                        let known = inner
                            .transceivers
                            .iter()
                            .any(|t| t.mid.as_deref() == Some(section.mid.as_str()));
                        if !known {
                            inner.transceivers.push(Transceiver {
                                kind: section.kind,
                                direction: Direction::RecvOnly,
                                mid: Some(section.mid.clone()),
                                track: None,
                            });
                        }
                    }
                    inner.signaling = SignalingState::HaveRemoteOffer;
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                    inner.signaling = SignalingState::Stable;
                    inner.pending_mids.clear();
                    complete_exchange(&mut inner, &mut events);
                }
                (_, state) => return Err(NegotiationError::InvalidState(state.name().into())),
            }

            for section in parsed.sections.iter().filter(|s| s.direction.sends()) {
                if inner.fired.insert(section.mid.clone()) {
                    events.push(ConnectionEvent::Track(RemoteTrack {
                        id: murmur_common::new_id(),
                        kind: section.kind,
                        mid: section.mid.clone(),
                    }));
                }
            }
            inner.remote = Some(parsed);
        }
        for event in events {
            self.emit(event);
        }
        Ok(())
    }
}

/// First exchange (and the first after an ICE failure) brings the
/// connection up.
fn complete_exchange(inner: &mut Inner, events: &mut Vec<ConnectionEvent>) {
    if !inner.ice_connected {
        inner.ice_connected = true;
        events.push(ConnectionEvent::IceConnectionState(
            IceConnectionState::Connected,
        ));
        events.push(ConnectionEvent::ConnectionState(
            PeerConnectionState::Connected,
        ));
    }
}

fn allocate_mid(used: &mut HashSet<String>) -> String {
    let mut next = 0u32;
    loop {
        let candidate = next.to_string();
        if used.insert(candidate.clone()) {
            return candidate;
        }
        next += 1;
    }
}

fn new_ufrag() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    fn add_transceiver(&self, kind: MediaKind, direction: Direction) -> TransceiverId {
        let mut inner = self.lock();
        inner.transceivers.push(Transceiver {
            kind,
            direction,
            mid: None,
            track: None,
        });
        TransceiverId((inner.transceivers.len() - 1) as u32)
    }

    fn set_direction(
        &self,
        id: TransceiverId,
        direction: Direction,
    ) -> Result<(), NegotiationError> {
        let mut inner = self.lock();
        if inner.signaling == SignalingState::Closed {
            return Err(NegotiationError::Closed);
        }
        let transceiver = inner
            .transceivers
            .get_mut(id.0 as usize)
            .ok_or_else(|| NegotiationError::Backend(format!("unknown transceiver {}", id.0)))?;
        transceiver.direction = direction;
        Ok(())
    }

    fn replace_track(
        &self,
        id: TransceiverId,
        track: Option<LocalTrack>,
    ) -> Result<(), NegotiationError> {
        let mut inner = self.lock();
        if inner.signaling == SignalingState::Closed {
            return Err(NegotiationError::Closed);
        }
        let transceiver = inner
            .transceivers
            .get_mut(id.0 as usize)
            .ok_or_else(|| NegotiationError::Backend(format!("unknown transceiver {}", id.0)))?;
        if let Some(track) = &track {
            if track.kind() != transceiver.kind {
                return Err(NegotiationError::Backend(format!(
                    "cannot send {} on a {} transceiver",
                    track.kind(),
                    transceiver.kind
                )));
            }
        }
        transceiver.track = track;
        Ok(())
    }

    fn mid(&self, id: TransceiverId) -> Option<String> {
        self.lock()
            .transceivers
            .get(id.0 as usize)
            .and_then(|t| t.mid.clone())
    }

    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> Result<SessionDescription, NegotiationError> {
        tokio::task::yield_now().await;
        self.offer_sync(options)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        tokio::task::yield_now().await;
        self.answer_sync()
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.set_local_sync(description)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.set_remote_sync(description)
    }

    async fn rollback(&self) -> Result<(), NegotiationError> {
        let mut inner = self.lock();
        match inner.signaling {
            SignalingState::Closed => return Err(NegotiationError::Closed),
            SignalingState::HaveLocalOffer => {
                let pending = std::mem::take(&mut inner.pending_mids);
                for index in pending {
                    if let Some(t) = inner.transceivers.get_mut(index) {
                        t.mid = None;
                    }
                }
            }
            SignalingState::HaveRemoteOffer | SignalingState::Stable => {}
        }
        inner.signaling = SignalingState::Stable;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let mut inner = self.lock();
        if inner.signaling == SignalingState::Closed {
            return Err(NegotiationError::Closed);
        }
        if inner.remote.is_none() {
            return Err(NegotiationError::InvalidState(
                "candidate before remote description".into(),
            ));
        }
        if candidate.candidate.is_empty() || inner.candidates.contains(&candidate) {
            debug!("Ignoring end-of-candidates or duplicate candidate");
            return Ok(());
        }
        inner.candidates.push(candidate);
        Ok(())
    }

    fn close(&self) {
        {
            let mut inner = self.lock();
            if inner.signaling == SignalingState::Closed {
                return;
            }
            inner.signaling = SignalingState::Closed;
            inner.ice_connected = false;
        }
        self.emit(ConnectionEvent::ConnectionState(PeerConnectionState::Closed));
    }

    fn is_closed(&self) -> bool {
        self.lock().signaling == SignalingState::Closed
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Hands out loopback connections and keeps them for inspection.
#[derive(Default)]
pub struct LoopbackFactory {
    created: Mutex<Vec<Arc<LoopbackConnection>>>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections(&self) -> Vec<Arc<LoopbackConnection>> {
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn latest(&self) -> Option<Arc<LoopbackConnection>> {
        self.connections().pop()
    }
}

impl ConnectionFactory for LoopbackFactory {
    fn create(
        &self,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<ConnectionEvent>), NegotiationError>
    {
        let (connection, events) = LoopbackConnection::open();
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&connection));
        let connection: Arc<dyn PeerConnection> = connection;
        Ok((connection, events))
    }
}
