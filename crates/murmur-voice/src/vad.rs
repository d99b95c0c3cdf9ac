//! Voice activity detection.
//!
//! Frame energy (RMS) against a fixed threshold, with hysteresis: the
//! speaking flag turns on after `attack_frames` consecutive loud frames and
//! off after `release_frames` consecutive quiet ones.

use murmur_config::VadConfig;

#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    threshold: f64,
    attack_frames: u32,
    release_frames: u32,
    speaking: bool,
    /// Consecutive frames disagreeing with the current flag.
    run: u32,
}

impl VoiceActivityDetector {
    pub fn new(config: &VadConfig) -> Self {
        Self {
            threshold: config.threshold,
            attack_frames: config.attack_frames.max(1),
            release_frames: config.release_frames.max(1),
            speaking: false,
            run: 0,
        }
    }

    /// Feed one frame. Returns the new flag when it flips.
    pub fn process(&mut self, frame: &[f32]) -> Option<bool> {
        let active = rms(frame) >= self.threshold;
        if active == self.speaking {
            self.run = 0;
            return None;
        }

        self.run += 1;
        let needed = if active {
            self.attack_frames
        } else {
            self.release_frames
        };
        if self.run < needed {
            return None;
        }

        self.speaking = active;
        self.run = 0;
        Some(active)
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Force the flag off, e.g. when the track is muted.
    pub fn reset(&mut self) -> Option<bool> {
        self.run = 0;
        if self.speaking {
            self.speaking = false;
            Some(false)
        } else {
            None
        }
    }
}

fn rms(frame: &[f32]) -> f64 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f64 = frame.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / frame.len() as f64).sqrt()
}
