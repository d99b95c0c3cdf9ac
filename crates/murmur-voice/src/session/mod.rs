//! Voice session store: the public control surface and the observable
//! voice state.
//!
//! A session exists between `connect` and `disconnect`. It owns the peer
//! connection, the negotiation task and the track controller. Teardown is
//! synchronous: the connection is closed and the task aborted without
//! waiting for in-flight negotiation.

mod types;


pub use types::{VoiceBackends, VoiceEvent, VoiceStateSnapshot};

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use murmur_common::{DeviceError, EventBus, MurmurError, Result, SessionId};
use murmur_config::MurmurConfig;

use crate::backend::PeerConnection;
use crate::media::LocalTrack;
use crate::negotiation::{EngineContext, EngineHandle, EngineSnapshot, NegotiationEngine};
use crate::protocol::{stream_keys, Envelope, MediaKind};
use crate::registry::RemoteStream;
use crate::tracks::{EnableOutcome, TrackController};
use crate::vad::VoiceActivityDetector;

struct ActiveSession {
    id: SessionId,
    channel_id: String,
    connection: Arc<dyn PeerConnection>,
    engine: EngineHandle,
    tracks: Arc<TrackController>,
    task: JoinHandle<()>,
    vad_task: Option<JoinHandle<()>>,
}

impl ActiveSession {
    /// Close the connection and stop everything derived from it.
    fn shutdown(self) {
        self.connection.close();
        self.task.abort();
        if let Some(vad) = self.vad_task {
            vad.abort();
        }
        self.tracks.stop_all();
    }
}

pub struct VoiceSession {
    user_id: String,
    config: MurmurConfig,
    backends: VoiceBackends,
    events: EventBus<VoiceEvent>,
    state: Arc<watch::Sender<VoiceStateSnapshot>>,
    active: Mutex<Option<ActiveSession>>,
}

impl VoiceSession {
    pub fn new(user_id: impl Into<String>, config: MurmurConfig, backends: VoiceBackends) -> Self {
        let events = EventBus::new(config.voice.event_capacity as usize);
        let (state, _) = watch::channel(VoiceStateSnapshot::default());
        Self {
            user_id: user_id.into(),
            config,
            backends,
            events,
            state: Arc::new(state),
            active: Mutex::new(None),
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_active(&self) -> Option<ActiveSession> {
        self.lock_active().take()
    }

    fn handles(&self) -> Result<(EngineHandle, Arc<TrackController>)> {
        self.lock_active()
            .as_ref()
            .map(|a| (a.engine.clone(), Arc::clone(&a.tracks)))
            .ok_or(MurmurError::NotConnected)
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    /// Change-notifying view of the voice state.
    pub fn state(&self) -> watch::Receiver<VoiceStateSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> VoiceStateSnapshot {
        self.state.borrow().clone()
    }

    pub fn channel_id(&self) -> Option<String> {
        self.lock_active().as_ref().map(|a| a.channel_id.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.lock_active().is_some()
    }

    pub async fn remote_streams(&self) -> Result<Vec<RemoteStream>> {
        let (engine, _) = self.handles()?;
        engine.remote_streams().await
    }

    pub async fn engine_snapshot(&self) -> Result<EngineSnapshot> {
        let (engine, _) = self.handles()?;
        engine.inspect().await
    }

    /// Devices opened during the current session.
    pub fn acquisition_count(&self) -> usize {
        self.handles()
            .map(|(_, tracks)| tracks.acquisition_count())
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Join `channel_id`, leaving the current channel first if needed.
    pub async fn connect(&self, channel_id: &str) -> Result<()> {
        match self.channel_id() {
            Some(current) if current == channel_id => {
                debug!(channel_id, "Already connected");
                return Ok(());
            }
            Some(_) => self.disconnect().await?,
            None => {}
        }

        let (connection, connection_events) = self.backends.connections.create()?;
        let engine = NegotiationEngine::new(EngineContext {
            user_id: self.user_id.clone(),
            config: self.config.negotiation.clone(),
            connection: Arc::clone(&connection),
            transport: Arc::clone(&self.backends.transport),
            events: self.events.clone(),
            state: Arc::clone(&self.state),
        });
        let (handle, task) = engine.spawn(
            connection_events,
            self.config.voice.signal_queue_capacity as usize,
        );
        let tracks = Arc::new(TrackController::new(
            Arc::clone(&self.backends.capture),
            handle.clone(),
        ));

        let id = SessionId::new();
        let replaced = self.lock_active().replace(ActiveSession {
            id: id.clone(),
            channel_id: channel_id.to_string(),
            connection,
            engine: handle,
            tracks,
            task,
            vad_task: None,
        });
        if let Some(stale) = replaced {
            // Lost a race with a concurrent connect.
            stale.shutdown();
        }

        let user_id = self.user_id.clone();
        self.state.send_modify(|s| {
            let mut participants = std::mem::take(&mut s.participants);
            participants.insert(user_id, channel_id.to_string());
            *s = VoiceStateSnapshot {
                channel_id: Some(channel_id.to_string()),
                participants,
                ..VoiceStateSnapshot::default()
            };
        });
        info!(channel_id, session = %id, "Voice session connected");
        self.events.publish(VoiceEvent::Connected {
            channel_id: channel_id.to_string(),
        });

        self.send_presence(Some(channel_id)).await;

        if self.config.voice.auto_enable_microphone {
            if let Err(e) = self.toggle_mic().await {
                warn!(error = %e, "Could not enable microphone on connect");
            }
        }
        Ok(())
    }

    /// Leave the current channel. A no-op when not connected.
    pub async fn disconnect(&self) -> Result<()> {
        let Some(active) = self.take_active() else {
            return Ok(());
        };
        self.teardown(active);
        self.send_presence(None).await;
        Ok(())
    }

    fn teardown(&self, active: ActiveSession) {
        let channel_id = active.channel_id.clone();
        let id = active.id.clone();
        active.shutdown();

        let user_id = self.user_id.clone();
        self.state.send_modify(|s| {
            s.participants.remove(&user_id);
            s.clear_session();
        });
        info!(%channel_id, session = %id, "Voice session disconnected");
        self.events
            .publish(VoiceEvent::Disconnected { channel_id });
    }

    async fn send_presence(&self, channel_id: Option<&str>) {
        let envelope = Envelope::presence(&self.user_id, channel_id);
        if let Err(e) = self.backends.transport.send(envelope).await {
            warn!(error = %e, "Failed to send voice presence");
        }
    }

    // -----------------------------------------------------------------------
    // Toggles
    // -----------------------------------------------------------------------

    pub async fn toggle_mic(&self) -> Result<()> {
        let (engine, tracks) = self.handles()?;
        let muted = self.state.borrow().muted;

        if muted {
            match tracks.enable(stream_keys::USER, MediaKind::Audio).await? {
                EnableOutcome::Declined => return Ok(()),
                EnableOutcome::Acquired(track) => self.start_vad(engine, track),
                EnableOutcome::Resumed(_) => {}
            }
        } else {
            tracks.disable(stream_keys::USER, MediaKind::Audio).await?;
        }

        self.state.send_modify(|s| s.muted = !muted);
        debug!(muted = !muted, "Microphone toggled");
        Ok(())
    }

    pub async fn toggle_camera(&self) -> Result<()> {
        let (_, tracks) = self.handles()?;
        let hidden = self.state.borrow().camera_hidden;

        if hidden {
            let outcome = tracks.enable(stream_keys::USER, MediaKind::Video).await?;
            if !outcome.is_live() {
                return Ok(());
            }
        } else {
            tracks.disable(stream_keys::USER, MediaKind::Video).await?;
        }

        self.state.send_modify(|s| s.camera_hidden = !hidden);
        debug!(camera_hidden = !hidden, "Camera toggled");
        Ok(())
    }

    /// Share the display, with its audio when the source provides any.
    pub async fn toggle_screen(&self) -> Result<()> {
        let (_, tracks) = self.handles()?;
        let sharing = self.state.borrow().screenshare_enabled;

        if sharing {
            tracks.disable(stream_keys::SCREEN, MediaKind::Video).await?;
            tracks.disable(stream_keys::SCREEN, MediaKind::Audio).await?;
        } else {
            let video = tracks.enable(stream_keys::SCREEN, MediaKind::Video).await?;
            if !video.is_live() {
                return Ok(());
            }
            match tracks.enable(stream_keys::SCREEN, MediaKind::Audio).await {
                Ok(_) => {}
                Err(MurmurError::Device(DeviceError::NotFound(source))) => {
                    debug!(%source, "Display source has no audio");
                }
                Err(e) => return Err(e),
            }
        }

        self.state.send_modify(|s| s.screenshare_enabled = !sharing);
        debug!(screenshare = !sharing, "Screen share toggled");
        Ok(())
    }

    pub async fn play_music(&self) -> Result<()> {
        let (_, tracks) = self.handles()?;
        let playing = self.state.borrow().music_playing;

        if playing {
            tracks.disable(stream_keys::MUSIC, MediaKind::Audio).await?;
        } else {
            let outcome = tracks.enable(stream_keys::MUSIC, MediaKind::Audio).await?;
            if !outcome.is_live() {
                return Ok(());
            }
        }

        self.state.send_modify(|s| s.music_playing = !playing);
        debug!(music = !playing, "Music toggled");
        Ok(())
    }

    /// Run voice-activity detection on a freshly captured microphone.
    fn start_vad(&self, engine: EngineHandle, track: LocalTrack) {
        let Some(mut frames) = self.backends.capture.audio_frames(&track) else {
            debug!("Capture backend provides no audio frames, VAD disabled");
            return;
        };

        let mut vad = VoiceActivityDetector::new(&self.config.vad);
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let user_id = self.user_id.clone();
        let task = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if track.is_stopped() {
                    break;
                }
                let change = if track.is_enabled() {
                    vad.process(&frame)
                } else {
                    vad.reset()
                };
                if let Some(speaking) = change {
                    state.send_modify(|s| s.speaking = speaking);
                    events.publish(VoiceEvent::SpeakingChanged {
                        user_id: user_id.clone(),
                        speaking,
                    });
                    if engine.speaking(speaking).await.is_err() {
                        break;
                    }
                }
            }
        });

        match self.lock_active().as_mut() {
            Some(active) => {
                if let Some(previous) = active.vad_task.replace(task) {
                    previous.abort();
                }
            }
            None => task.abort(),
        }
    }

    // -----------------------------------------------------------------------
    // Inbound transport messages
    // -----------------------------------------------------------------------

    /// Route one envelope from the chat transport.
    pub async fn handle_envelope(&self, envelope: Envelope) {
        match envelope {
            Envelope::VoiceDispatch { user_id, payload } => {
                if user_id == self.user_id {
                    return;
                }
                let Ok((engine, _)) = self.handles() else {
                    debug!(from = %user_id, kind = payload.kind(), "Dropping signal while not connected");
                    return;
                };
                if let Err(e) = engine.signal(&user_id, payload).await {
                    debug!(error = %e, "Engine gone, signal dropped");
                }
            }
            Envelope::VoiceState { user_id, state } => {
                let channel = Envelope::presence_channel(&state);
                self.handle_presence(&user_id, channel).await;
            }
            Envelope::Unknown => {}
        }
    }

    async fn handle_presence(&self, user_id: &str, channel: Option<&str>) {
        if user_id == self.user_id {
            if channel.is_none() {
                if let Some(active) = self.take_active() {
                    warn!(channel_id = %active.channel_id, "Removed from voice channel by server");
                    self.teardown(active);
                }
            }
            return;
        }

        let mut previous = None;
        self.state.send_modify(|s| {
            previous = match channel {
                Some(c) => s.participants.insert(user_id.to_string(), c.to_string()),
                None => s.participants.remove(user_id),
            };
        });

        let Some(ours) = self.channel_id() else {
            return;
        };
        let Ok((engine, _)) = self.handles() else {
            return;
        };
        let was_here = previous.as_deref() == Some(ours.as_str());
        let is_here = channel == Some(ours.as_str());

        let result = if is_here && !was_here {
            engine.peer_joined(user_id).await
        } else if !is_here && (was_here || channel.is_none()) {
            engine.remove_user(user_id).await
        } else {
            Ok(())
        };
        if let Err(e) = result {
            debug!(user_id, error = %e, "Presence update not applied");
        }
    }

    /// Feed envelopes from an inbound queue until it closes.
    pub async fn serve_inbound(&self, mut inbound: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = inbound.recv().await {
            self.handle_envelope(envelope).await;
        }
        debug!(user_id = %self.user_id, "Inbound envelope stream ended");
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        let active = self
            .active
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(active) = active {
            active.shutdown();
        }
    }
}
