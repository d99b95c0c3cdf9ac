use tokio::sync::{mpsc, oneshot};

use murmur_common::{MurmurError, NegotiationError, Result};

use crate::media::LocalTrack;
use crate::protocol::{MediaKind, TrackInfo, VoiceSignal};
use crate::registry::RemoteStream;

/// Offer/answer state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Nothing negotiated yet.
    Idle,
    /// Local offer applied and sent, waiting for the answer.
    MakingOffer,
    /// Applying the answer to our offer.
    SettingRemoteAnswer,
    Stable,
}

impl NegotiationState {
    /// A new offer may start or a remote offer be accepted.
    pub fn is_quiescent(&self) -> bool {
        matches!(self, Self::Idle | Self::Stable)
    }
}

/// Point-in-time view of the engine, for tests and diagnostics.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub state: NegotiationState,
    pub transceivers: usize,
    pub manifest: Vec<TrackInfo>,
    pub restart_attempts: u32,
}

pub(crate) enum EngineCommand {
    Signal {
        from: String,
        signal: VoiceSignal,
    },
    AttachTrack {
        key: String,
        kind: MediaKind,
        track: LocalTrack,
        reply: oneshot::Sender<std::result::Result<(), NegotiationError>>,
    },
    Announce,
    PeerJoined {
        user_id: String,
    },
    RemoveUser {
        user_id: String,
    },
    SendSpeaking(bool),
    RemoteStreams(oneshot::Sender<Vec<RemoteStream>>),
    Inspect(oneshot::Sender<EngineSnapshot>),
}

/// Cheap, cloneable sender side of a running engine. Every method fails
/// with `NotConnected` once the engine task is gone.
#[derive(Clone)]
pub struct EngineHandle {
    pub(crate) tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    async fn command(&self, command: EngineCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| MurmurError::NotConnected)
    }

    /// Deliver an inbound signaling message from `from`.
    pub async fn signal(&self, from: &str, signal: VoiceSignal) -> Result<()> {
        self.command(EngineCommand::Signal {
            from: from.to_string(),
            signal,
        })
        .await
    }

    /// Bind `track` to the reserved `(key, kind)` transceiver and
    /// renegotiate.
    pub async fn attach(&self, key: &str, kind: MediaKind, track: LocalTrack) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(EngineCommand::AttachTrack {
            key: key.to_string(),
            kind,
            track,
            reply,
        })
        .await?;
        rx.await.map_err(|_| MurmurError::NotConnected)??;
        Ok(())
    }

    /// Broadcast the current manifest as a `Have`.
    pub async fn announce(&self) -> Result<()> {
        self.command(EngineCommand::Announce).await
    }

    pub async fn peer_joined(&self, user_id: &str) -> Result<()> {
        self.command(EngineCommand::PeerJoined {
            user_id: user_id.to_string(),
        })
        .await
    }

    pub async fn remove_user(&self, user_id: &str) -> Result<()> {
        self.command(EngineCommand::RemoveUser {
            user_id: user_id.to_string(),
        })
        .await
    }

    pub async fn speaking(&self, speaking: bool) -> Result<()> {
        self.command(EngineCommand::SendSpeaking(speaking)).await
    }

    pub async fn remote_streams(&self) -> Result<Vec<RemoteStream>> {
        let (reply, rx) = oneshot::channel();
        self.command(EngineCommand::RemoteStreams(reply)).await?;
        rx.await.map_err(|_| MurmurError::NotConnected)
    }

    pub async fn inspect(&self) -> Result<EngineSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.command(EngineCommand::Inspect(reply)).await?;
        rx.await.map_err(|_| MurmurError::NotConnected)
    }
}
