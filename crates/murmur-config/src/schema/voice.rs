//! Voice session configuration types.

use serde::{Deserialize, Serialize};

/// Session-level voice settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Buffer size of the UI event bus.
    pub event_capacity: u32,
    /// Bound of the queue feeding the per-session negotiation task.
    pub signal_queue_capacity: u32,
    /// Open the microphone as part of `connect`.
    pub auto_enable_microphone: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            signal_queue_capacity: 256,
            auto_enable_microphone: false,
        }
    }
}
