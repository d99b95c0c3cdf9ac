use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use murmur_common::DeviceError;

use crate::backend::CaptureBackend;
use crate::media::{AudioFrame, CaptureSource, LocalTrack};
use crate::protocol::MediaKind;

const FRAME_QUEUE: usize = 64;

#[derive(Default)]
struct CaptureState {
    acquisitions: HashMap<CaptureSource, usize>,
    failures: HashMap<CaptureSource, DeviceError>,
    feeds: Vec<(LocalTrack, mpsc::Sender<AudioFrame>)>,
    prompt_delay: Option<Duration>,
}

/// Synthetic devices. Every source is available unless told otherwise, and
/// audio frames are whatever the caller pushes.
#[derive(Default)]
pub struct LoopbackCapture {
    state: Mutex<CaptureState>,
}

impl LoopbackCapture {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every later acquisition of `source` fail with `error`.
    pub fn fail_with(&self, source: CaptureSource, error: DeviceError) {
        self.lock().failures.insert(source, error);
    }

    /// Simulate a permission prompt the user takes `delay` to answer.
    pub fn set_prompt_delay(&self, delay: Duration) {
        self.lock().prompt_delay = Some(delay);
    }

    /// Successful acquisitions of `source` so far.
    pub fn acquisitions(&self, source: CaptureSource) -> usize {
        self.lock().acquisitions.get(&source).copied().unwrap_or(0)
    }

    pub fn total_acquisitions(&self) -> usize {
        self.lock().acquisitions.values().sum()
    }

    /// Deliver one frame to every live audio feed. Returns how many feeds
    /// took it.
    pub fn push_audio(&self, frame: &[f32]) -> usize {
        let mut state = self.lock();
        state
            .feeds
            .retain(|(track, tx)| !track.is_stopped() && !tx.is_closed());
        state
            .feeds
            .iter()
            .filter(|(_, tx)| tx.try_send(frame.to_vec()).is_ok())
            .count()
    }
}

#[async_trait]
impl CaptureBackend for LoopbackCapture {
    async fn acquire(&self, source: CaptureSource) -> Result<LocalTrack, DeviceError> {
        let delay = self.lock().prompt_delay;
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }

        let mut state = self.lock();
        if let Some(error) = state.failures.get(&source) {
            return Err(error.clone());
        }
        *state.acquisitions.entry(source).or_default() += 1;
        debug!(?source, "Loopback device acquired");
        Ok(LocalTrack::new(source.kind(), format!("loopback {source:?}")))
    }

    fn audio_frames(&self, track: &LocalTrack) -> Option<mpsc::Receiver<AudioFrame>> {
        if track.kind() != MediaKind::Audio {
            return None;
        }
        let (tx, rx) = mpsc::channel(FRAME_QUEUE);
        self.lock().feeds.push((track.clone(), tx));
        Some(rx)
    }
}
