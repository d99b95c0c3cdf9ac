//! Local capture tracks and their binding to reserved transceivers.
//!
//! A device is opened at most once per `(key, kind)` for the life of a
//! session. Muting flips the track's enabled flag; the transceiver keeps
//! the track and nothing is renegotiated. Tracks are only stopped on
//! teardown.


use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use murmur_common::{MurmurError, Result};

use crate::backend::CaptureBackend;
use crate::media::{CaptureSource, LocalTrack};
use crate::negotiation::EngineHandle;
use crate::protocol::MediaKind;

type Slot = Arc<tokio::sync::Mutex<Option<LocalTrack>>>;

/// Result of [`TrackController::enable`].
#[derive(Debug, Clone)]
pub enum EnableOutcome {
    /// A device was opened and bound.
    Acquired(LocalTrack),
    /// The held track is live again (or already was).
    Resumed(LocalTrack),
    /// The user declined or dismissed the capture prompt.
    Declined,
}

impl EnableOutcome {
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Declined)
    }
}

pub struct TrackController {
    capture: Arc<dyn CaptureBackend>,
    engine: EngineHandle,
    /// One async lock per `(key, kind)`; an enable holding it across the
    /// capture prompt makes concurrent enables wait instead of opening a
    /// second device.
    slots: Mutex<HashMap<(String, MediaKind), Slot>>,
    acquisitions: AtomicUsize,
    closed: AtomicBool,
}

impl TrackController {
    pub fn new(capture: Arc<dyn CaptureBackend>, engine: EngineHandle) -> Self {
        Self {
            capture,
            engine,
            slots: Mutex::new(HashMap::new()),
            acquisitions: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn slot(&self, key: &str, kind: MediaKind) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            slots
                .entry((key.to_string(), kind))
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None))),
        )
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MurmurError::NotConnected);
        }
        Ok(())
    }

    /// Start sending on `(key, kind)`, reusing the held track when there
    /// is one.
    pub async fn enable(&self, key: &str, kind: MediaKind) -> Result<EnableOutcome> {
        self.ensure_open()?;
        let source = CaptureSource::for_stream(key, kind)
            .ok_or_else(|| MurmurError::Other(format!("no capture source for {key}/{kind}")))?;

        let slot = self.slot(key, kind);
        let mut held = slot.lock().await;

        if let Some(track) = held.as_ref().filter(|t| !t.is_stopped()) {
            if !track.is_enabled() {
                track.set_enabled(true);
                debug!(key, %kind, "Track re-enabled");
                self.engine.announce().await?;
            }
            return Ok(EnableOutcome::Resumed(track.clone()));
        }

        let track = match self.capture.acquire(source).await {
            Ok(track) => track,
            Err(e) if e.is_silent() => {
                debug!(key, %kind, error = %e, "Capture declined");
                return Ok(EnableOutcome::Declined);
            }
            Err(e) => {
                warn!(key, %kind, error = %e, "Capture failed");
                return Err(e.into());
            }
        };
        self.acquisitions.fetch_add(1, Ordering::AcqRel);

        if let Err(e) = self.ensure_open() {
            track.stop();
            return Err(e);
        }
        if let Err(e) = self.engine.attach(key, kind, track.clone()).await {
            track.stop();
            return Err(e);
        }
        if let Err(e) = self.ensure_open() {
            track.stop();
            return Err(e);
        }

        info!(key, %kind, label = track.label(), "Capture started");
        *held = Some(track.clone());
        Ok(EnableOutcome::Acquired(track))
    }

    /// Stop sending on `(key, kind)` without releasing the device. Returns
    /// whether anything changed.
    pub async fn disable(&self, key: &str, kind: MediaKind) -> Result<bool> {
        self.ensure_open()?;
        let slot = self.slot(key, kind);
        let held = slot.lock().await;

        match held.as_ref() {
            Some(track) if track.is_enabled() => {
                track.set_enabled(false);
                debug!(key, %kind, "Track disabled");
                self.engine.announce().await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn track(&self, key: &str, kind: MediaKind) -> Option<LocalTrack> {
        self.slot(key, kind).lock().await.clone()
    }

    pub async fn is_enabled(&self, key: &str, kind: MediaKind) -> bool {
        self.track(key, kind)
            .await
            .is_some_and(|t| t.is_enabled() && !t.is_stopped())
    }

    /// Devices opened through this controller.
    pub fn acquisition_count(&self) -> usize {
        self.acquisitions.load(Ordering::Acquire)
    }

    /// Release every device. Enables still waiting on a prompt stop their
    /// track when it resolves.
    pub fn stop_all(&self) {
        self.closed.store(true, Ordering::Release);
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        for ((key, kind), slot) in slots.iter() {
            if let Ok(mut held) = slot.try_lock() {
                if let Some(track) = held.take() {
                    track.stop();
                    debug!(%key, %kind, "Track stopped");
                }
            }
        }
    }
}
