//! Voice-activity detection settings.

use serde::{Deserialize, Serialize};

/// Energy gate with hysteresis: `attack_frames` loud frames in a row turn
/// speaking on, `release_frames` quiet frames in a row turn it off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS level (0.0-1.0) above which a frame counts as active.
    pub threshold: f64,
    pub attack_frames: u32,
    pub release_frames: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.02,
            attack_frames: 3,
            release_frames: 25,
        }
    }
}
