//! Negotiation engine: one task per session owning the peer connection's
//! offer/answer state.
//!
//! Follows the perfect-negotiation pattern. Renegotiation requests that
//! arrive while an offer is in flight are coalesced into a single follow-up
//! offer. On glare the impolite peer ignores the remote offer; the polite
//! peer rolls back its own and answers. Unless configured, the peer with
//! the greater user id is the polite one. An offer left unanswered for
//! `offer_timeout_ms` is rolled back and sent again. ICE failures schedule
//! a restart offer with exponential backoff.
//!
//! A connection has exactly one remote peer. It is fixed by the first
//! `PeerJoined` or offer/answer and released when that user leaves;
//! negotiation signals from anyone else are dropped.

mod types;

#[cfg(test)]
mod tests;

pub use types::{EngineHandle, EngineSnapshot, NegotiationState};

pub(crate) use types::EngineCommand;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use murmur_common::{EventBus, NegotiationError};
use murmur_config::NegotiationConfig;

use crate::backend::{ConnectionEvent, PeerConnection, SignalingTransport};
use crate::media::{
    IceCandidate, IceConnectionState, LocalTrack, OfferOptions, PeerConnectionState,
    SessionDescription,
};
use crate::protocol::{Envelope, MediaKind, TrackInfo, VoiceSignal};
use crate::registry::{StreamRegistry, STANDARD_SLOTS};
use crate::session::{VoiceEvent, VoiceStateSnapshot};

/// Everything an engine needs from its session.
pub(crate) struct EngineContext {
    pub user_id: String,
    pub config: NegotiationConfig,
    pub connection: Arc<dyn PeerConnection>,
    pub transport: Arc<dyn SignalingTransport>,
    pub events: EventBus<VoiceEvent>,
    pub state: Arc<watch::Sender<VoiceStateSnapshot>>,
}

pub(crate) struct NegotiationEngine {
    ctx: EngineContext,
    registry: StreamRegistry,
    state: NegotiationState,
    /// A renegotiation was requested while one could not start.
    pending: bool,
    pending_ice_restart: bool,
    restart_attempts: u32,
    restart_at: Option<Instant>,
    /// When the outstanding offer is given up on.
    offer_deadline: Option<Instant>,
    peer: Option<String>,
}

impl NegotiationEngine {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            registry: StreamRegistry::new(),
            state: NegotiationState::Idle,
            pending: false,
            pending_ice_restart: false,
            restart_attempts: 0,
            restart_at: None,
            offer_deadline: None,
            peer: None,
        }
    }

    /// Reserve the standard transceivers and start the engine task.
    pub fn spawn(
        mut self,
        connection_events: mpsc::Receiver<ConnectionEvent>,
        queue_capacity: usize,
    ) -> (EngineHandle, JoinHandle<()>) {
        for (key, kind) in STANDARD_SLOTS {
            self.registry
                .reserve_transceiver(&*self.ctx.connection, key, kind);
        }

        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let task = tokio::spawn(self.run(rx, connection_events));
        (EngineHandle { tx }, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut connection_events: mpsc::Receiver<ConnectionEvent>,
    ) {
        let mut events_open = true;
        loop {
            let restart_at = self.restart_at;
            let offer_deadline = self.offer_deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = connection_events.recv(), if events_open => match event {
                    Some(event) => self.handle_connection_event(event).await,
                    None => events_open = false,
                },
                _ = sleep_until(restart_at.unwrap_or_else(Instant::now)), if restart_at.is_some() => {
                    self.restart_at = None;
                    self.restart_ice().await;
                }
                _ = sleep_until(offer_deadline.unwrap_or_else(Instant::now)), if offer_deadline.is_some() => {
                    self.offer_deadline = None;
                    self.expire_offer().await;
                }
            }

            if self.ctx.connection.is_closed() {
                debug!(user_id = %self.ctx.user_id, "Connection closed, stopping negotiation");
                break;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Signal { from, signal } => self.handle_signal(&from, signal).await,
            EngineCommand::AttachTrack {
                key,
                kind,
                track,
                reply,
            } => {
                let result = self.attach_track(&key, kind, track);
                let bound = result.is_ok();
                let _ = reply.send(result);
                if bound {
                    self.negotiate().await;
                    self.announce().await;
                }
            }
            EngineCommand::Announce => self.announce().await,
            EngineCommand::PeerJoined { user_id } => {
                if !self.accept_peer(&user_id) {
                    warn!(%user_id, peer = ?self.peer, "Voice connection already has a peer, ignoring join");
                    return;
                }
                info!(%user_id, "Peer joined, renegotiating");
                self.registry.readmit(&user_id);
                if self.state == NegotiationState::MakingOffer {
                    // The outstanding offer went to nobody.
                    if let Err(e) = self.rollback().await {
                        warn!(error = %e, "Rollback of unanswered offer failed");
                    }
                }
                self.negotiate().await;
            }
            EngineCommand::RemoveUser { user_id } => {
                if self.peer.as_deref() == Some(user_id.as_str()) {
                    self.peer = None;
                }
                for stream_id in self.registry.remove_user(&user_id) {
                    debug!(%stream_id, "Remote stream removed");
                    self.ctx
                        .events
                        .publish(VoiceEvent::RemoteStreamRemoved { stream_id });
                }
            }
            EngineCommand::SendSpeaking(speaking) => {
                self.send(VoiceSignal::Speaking { speaking }).await;
            }
            EngineCommand::RemoteStreams(reply) => {
                let _ = reply.send(self.registry.remote_streams());
            }
            EngineCommand::Inspect(reply) => {
                let _ = reply.send(EngineSnapshot {
                    state: self.state,
                    transceivers: self.registry.transceiver_count(),
                    manifest: self.registry.track_manifest(),
                    restart_attempts: self.restart_attempts,
                });
            }
        }
    }

    fn attach_track(
        &mut self,
        key: &str,
        kind: MediaKind,
        track: LocalTrack,
    ) -> Result<(), NegotiationError> {
        let handle = self
            .registry
            .bind_track(&*self.ctx.connection, key, kind, track)?;
        debug!(key, %kind, ?handle, "Track bound to reserved transceiver");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound signaling
    // -----------------------------------------------------------------------

    /// Bind the connection to `user_id` if it has no peer yet.
    fn accept_peer(&mut self, user_id: &str) -> bool {
        match &self.peer {
            Some(peer) => peer == user_id,
            None => {
                self.registry.readmit(user_id);
                self.peer = Some(user_id.to_string());
                true
            }
        }
    }

    /// Polite peers yield to a colliding remote offer.
    fn is_polite_towards(&self, from: &str) -> bool {
        self.ctx
            .config
            .polite
            .unwrap_or_else(|| self.ctx.user_id.as_str() > from)
    }

    async fn handle_signal(&mut self, from: &str, signal: VoiceSignal) {
        debug!(from, kind = signal.kind(), state = ?self.state, "Signal received");
        let ours = match signal {
            VoiceSignal::Offer { .. } | VoiceSignal::Answer { .. } => self.accept_peer(from),
            VoiceSignal::Candidate(_) | VoiceSignal::Have { .. } => {
                self.peer.as_deref().map_or(true, |peer| peer == from)
            }
            VoiceSignal::Want { .. } | VoiceSignal::Speaking { .. } => true,
        };
        if !ours {
            warn!(from, kind = signal.kind(), peer = ?self.peer, "Dropping signal from outside this connection");
            return;
        }
        match signal {
            VoiceSignal::Offer { sdp, tracks } => self.handle_offer(from, sdp, tracks).await,
            VoiceSignal::Answer { sdp } => self.handle_answer(sdp).await,
            VoiceSignal::Candidate(candidate) => self.handle_candidate(candidate).await,
            VoiceSignal::Have { user_id, tracks } => self.apply_have(&user_id, &tracks),
            VoiceSignal::Want { mid } => {
                debug!(from, %mid, "Peer wants media on mid (advisory)");
            }
            VoiceSignal::Speaking { speaking } => {
                self.ctx.events.publish(VoiceEvent::SpeakingChanged {
                    user_id: from.to_string(),
                    speaking,
                });
            }
        }
    }

    async fn handle_offer(&mut self, from: &str, sdp: String, tracks: Vec<TrackInfo>) {
        if self.state == NegotiationState::MakingOffer {
            if !self.is_polite_towards(from) {
                debug!(from, "Ignoring colliding offer");
                return;
            }
            info!(from, "Offer collision, rolling back local offer");
            if let Err(e) = self.rollback().await {
                self.fail("rollback", e).await;
                return;
            }
            self.pending = true;
        }

        match self.accept_offer(sdp).await {
            Ok(answer) => {
                self.state = NegotiationState::Stable;
                self.registry.sync_mids(&*self.ctx.connection);
                self.apply_have(from, &tracks);
                self.send(VoiceSignal::Answer { sdp: answer.sdp }).await;
                self.announce().await;
                if self.registry.has_unassigned() {
                    self.pending = true;
                }
            }
            Err(e) => self.fail("offer", e).await,
        }

        self.flush_pending().await;
    }

    async fn accept_offer(&self, sdp: String) -> Result<SessionDescription, NegotiationError> {
        let connection = &self.ctx.connection;
        connection
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    async fn handle_answer(&mut self, sdp: String) {
        if self.state != NegotiationState::MakingOffer {
            debug!(state = ?self.state, "Dropping answer with no outstanding offer");
            return;
        }

        self.state = NegotiationState::SettingRemoteAnswer;
        self.offer_deadline = None;
        let applied = self
            .ctx
            .connection
            .set_remote_description(SessionDescription::answer(sdp))
            .await;
        match applied {
            Ok(()) => {
                self.state = NegotiationState::Stable;
                self.registry.sync_mids(&*self.ctx.connection);
                self.announce().await;
            }
            Err(e) => self.fail("answer", e).await,
        }

        self.flush_pending().await;
    }

    async fn handle_candidate(&mut self, candidate: IceCandidate) {
        if let Err(e) = self.ctx.connection.add_ice_candidate(candidate).await {
            debug!(error = %e, "Dropping ICE candidate");
        }
    }

    fn apply_have(&mut self, user_id: &str, tracks: &[TrackInfo]) {
        for stream_id in self.registry.handle_have(user_id, tracks) {
            self.publish_stream(&stream_id);
        }
    }

    fn publish_stream(&self, stream_id: &str) {
        if let Some(stream) = self.registry.remote_stream(stream_id) {
            self.ctx
                .events
                .publish(VoiceEvent::RemoteStreamUpdated(stream.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // Connection events
    // -----------------------------------------------------------------------

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::NegotiationNeeded => self.negotiate().await,
            ConnectionEvent::Track(track) => {
                debug!(mid = %track.mid, kind = %track.kind, "Inbound track");
                if let Some(stream_id) = self.registry.handle_track(track) {
                    self.publish_stream(&stream_id);
                }
            }
            ConnectionEvent::IceCandidate(candidate) => {
                self.send(VoiceSignal::Candidate(candidate)).await;
            }
            ConnectionEvent::IceConnectionState(state) => match state {
                IceConnectionState::Failed => self.schedule_ice_restart(),
                IceConnectionState::Connected | IceConnectionState::Completed => {
                    self.restart_attempts = 0;
                    self.restart_at = None;
                }
                _ => {}
            },
            ConnectionEvent::ConnectionState(state) => {
                let reported = match state {
                    PeerConnectionState::Failed if self.restart_at.is_some() => {
                        PeerConnectionState::Connecting
                    }
                    other => other,
                };
                self.set_connection_state(reported);
            }
        }
    }

    fn schedule_ice_restart(&mut self) {
        if self.restart_at.is_some() {
            return;
        }
        let max = self.ctx.config.ice_restart_max_attempts;
        if self.restart_attempts >= max {
            warn!(attempts = self.restart_attempts, "ICE restarts exhausted");
            self.ctx.events.publish(VoiceEvent::IceRestartsExhausted);
            self.set_connection_state(PeerConnectionState::Failed);
            return;
        }

        let delay = self.ctx.config.restart_delay(self.restart_attempts);
        self.restart_attempts += 1;
        info!(attempt = self.restart_attempts, max, ?delay, "Scheduling ICE restart");
        self.restart_at = Some(Instant::now() + delay);
        self.set_connection_state(PeerConnectionState::Connecting);
    }

    async fn restart_ice(&mut self) {
        if self.state == NegotiationState::MakingOffer {
            // The restart offer supersedes the unanswered one.
            if let Err(e) = self.rollback().await {
                warn!(error = %e, "Rollback of unanswered offer failed");
            }
        }
        self.pending_ice_restart = true;
        self.negotiate().await;
    }

    fn set_connection_state(&self, state: PeerConnectionState) {
        let changed = self.ctx.state.send_if_modified(|snapshot| {
            if snapshot.connection_state == state {
                return false;
            }
            snapshot.connection_state = state;
            true
        });
        if changed {
            debug!(?state, "Connection state changed");
            self.ctx
                .events
                .publish(VoiceEvent::ConnectionStateChanged(state));
        }
    }

    // -----------------------------------------------------------------------
    // Outbound offers
    // -----------------------------------------------------------------------

    /// Start an offer now, or remember that one is needed.
    async fn negotiate(&mut self) {
        if !self.state.is_quiescent() {
            debug!(state = ?self.state, "Renegotiation coalesced");
            self.pending = true;
            return;
        }

        let ice_restart = std::mem::take(&mut self.pending_ice_restart);
        self.pending = false;
        self.state = NegotiationState::MakingOffer;

        match self.make_offer(ice_restart).await {
            Ok(offer) => {
                self.registry.sync_mids(&*self.ctx.connection);
                let tracks = self.registry.track_manifest();
                debug!(tracks = tracks.len(), ice_restart, "Sending offer");
                self.offer_deadline = Some(Instant::now() + self.ctx.config.offer_timeout());
                self.send(VoiceSignal::Offer {
                    sdp: offer.sdp,
                    tracks,
                })
                .await;
            }
            Err(e) => self.fail("local offer", e).await,
        }
    }

    async fn make_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        let offer = self
            .ctx
            .connection
            .create_offer(OfferOptions { ice_restart })
            .await?;
        self.ctx
            .connection
            .set_local_description(offer.clone())
            .await?;
        Ok(offer)
    }

    /// The outstanding offer was lost or its answer dropped: take it back
    /// and offer again.
    async fn expire_offer(&mut self) {
        if self.state != NegotiationState::MakingOffer {
            return;
        }
        warn!(timeout = ?self.ctx.config.offer_timeout(), "Offer went unanswered, resending");
        if let Err(e) = self.rollback().await {
            warn!(error = %e, "Rollback of unanswered offer failed");
        }
        self.pending = true;
        self.flush_pending().await;
    }

    async fn flush_pending(&mut self) {
        if (self.pending || self.pending_ice_restart) && self.state.is_quiescent() {
            self.negotiate().await;
        }
    }

    /// Abandon the current transition and return to stable.
    async fn fail(&mut self, stage: &str, error: NegotiationError) {
        warn!(stage, error = %error, "Negotiation step failed");
        if let Err(e) = self.rollback().await {
            debug!(error = %e, "Rollback after failure also failed");
        }
        self.ctx.events.publish(VoiceEvent::NegotiationFailed {
            reason: format!("{stage}: {error}"),
        });
    }

    /// Drop any pending description and return to stable.
    async fn rollback(&mut self) -> Result<(), NegotiationError> {
        let result = self.ctx.connection.rollback().await;
        self.registry.sync_mids(&*self.ctx.connection);
        self.state = NegotiationState::Stable;
        self.offer_deadline = None;
        result
    }

    async fn announce(&self) {
        let tracks = self.registry.track_manifest();
        self.send(VoiceSignal::Have {
            user_id: self.ctx.user_id.clone(),
            tracks,
        })
        .await;
    }

    async fn send(&self, signal: VoiceSignal) {
        let kind = signal.kind();
        if let Err(e) = self
            .ctx
            .transport
            .send(Envelope::dispatch(&self.ctx.user_id, signal))
            .await
        {
            warn!(kind, error = %e, "Failed to send signal");
        }
    }
}
